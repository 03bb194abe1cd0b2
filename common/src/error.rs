use thiserror::Error;

/// 线协议层错误（客户端与服务端共用）
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Unexpected binary payload ({0} bytes)")]
    UnexpectedBinary(usize),

    #[error("Message received after terminal status")]
    AfterTerminal,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

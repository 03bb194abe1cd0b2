use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::SourceKind;
use thiserror::Error;

/// 单帧数据
///
/// 图像内容对流水线不透明（已编码，通常为JPEG）。
/// 每帧仅被检测阶段消费一次，随后仅用于传输编码。
#[derive(Debug, Clone)]
pub struct Frame {
    /// 帧序号（每个源内从1起单调递增）
    pub seq: u64,
    /// 采集时间
    pub captured_at: DateTime<Utc>,
    /// 编码图像数据
    pub data: Bytes,
}

impl Frame {
    pub fn new(seq: u64, data: Bytes) -> Self {
        Self {
            seq,
            captured_at: Utc::now(),
            data,
        }
    }
}

/// 源信息
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub kind: SourceKind,
    pub locator: String,
    /// RTSP协商成功的传输方式（"TCP"/"UDP"）
    pub transport: Option<String>,
    pub fps: Option<f64>,
    pub total_frames: Option<u64>,
}

/// 源错误类型
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    // ========== 打开错误（无流水线副作用，直接返回调用方） ==========
    #[error("Invalid locator: {0}")]
    InvalidLocator(String),

    #[error("Source not found: {0}")]
    NotFound(String),

    #[error("Source unreachable: {0}")]
    Unreachable(String),

    #[error("Transport negotiation failed: {0}")]
    TransportNegotiation(String),

    #[error("Source kind not supported on this platform: {0}")]
    Unsupported(String),

    // ========== 读取错误（单次视为瞬态，由上层按预算重试） ==========
    #[error("Read error: {0}")]
    Read(String),

    #[error("Read timed out")]
    ReadTimeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SourceError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::NotFound => SourceError::NotFound(error.to_string()),
            ErrorKind::TimedOut => SourceError::ReadTimeout,
            ErrorKind::ConnectionRefused => SourceError::Unreachable(error.to_string()),
            _ => SourceError::Io(error.to_string()),
        }
    }
}

/// 统一的帧数据源抽象
///
/// # 契约
///
/// - `next_frame`返回`Ok(None)`表示流正常结束
/// - 帧序号在单个源的生命周期内严格递增
/// - 瞬态解码失败以`Err`上报，本层不重试
#[async_trait]
pub trait FrameSource: Send {
    /// 读取下一帧
    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// 获取源信息
    fn info(&self) -> SourceInfo;

    /// 释放底层资源（幂等）
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_monotonic_fields() {
        let frame = Frame::new(7, Bytes::from_static(b"\xff\xd8\xff\xd9"));
        assert_eq!(frame.seq, 7);
        assert_eq!(frame.data.len(), 4);
    }

    #[test]
    fn test_io_error_mapping() {
        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            SourceError::from(not_found),
            SourceError::NotFound(_)
        ));

        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(SourceError::from(timeout), SourceError::ReadTimeout));
    }
}

//! 检测流WebSocket
//!
//! 每个连接独立订阅广播槽：慢客户端只会错过中间帧，不影响
//! 管线与其他连接。终止消息发送后服务端主动关闭连接。

use crate::pipeline::PipelineSupervisor;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
};
use common::{ClientCommand, ClientMessage, ProtocolError};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub async fn video_stream(
    ws: WebSocketUpgrade,
    State(supervisor): State<Arc<PipelineSupervisor>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, supervisor))
}

async fn handle_socket(socket: WebSocket, supervisor: Arc<PipelineSupervisor>) {
    let mut session = supervisor.broadcaster().subscribe();
    let (mut sender, mut receiver) = socket.split();
    info!(
        "📡 视频流连接建立: {} (在线{})",
        session.id(),
        supervisor.broadcaster().subscriber_count()
    );

    loop {
        tokio::select! {
            outgoing = session.next_message() => {
                let Some(msg) = outgoing else {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                let text = match serde_json::to_string(&*msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("消息序列化失败: {e}");
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
                // 终止消息之后服务端主动收尾
                if msg.is_terminal() {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        apply_client_message(&text, &supervisor).await;
                    }
                    // 客户端不应发送二进制帧，忽略并记录
                    Some(Ok(Message::Binary(data))) => {
                        warn!("{}", ProtocolError::UnexpectedBinary(data.len()));
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong由axum处理
                    Some(Err(e)) => {
                        debug!("连接读取错误: {e}");
                        break;
                    }
                }
            }
        }
    }

    session.close();
}

/// 解析并执行客户端控制消息
///
/// 无法解析或参数非法的消息记录后忽略，不中断连接。
async fn apply_client_message(text: &str, supervisor: &Arc<PipelineSupervisor>) {
    let parsed: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("无法解析的客户端消息: {}", ProtocolError::from(e));
            return;
        }
    };

    match parsed {
        ClientMessage::Command { command: ClientCommand::Stop } => {
            info!("收到客户端停止命令");
            if let Err(e) = supervisor.stop().await {
                warn!("停止失败: {e}");
            }
        }
        ClientMessage::Control {
            frame_skip,
            confidence,
            precision,
        } => {
            if let Err(e) = supervisor.apply_settings(frame_skip, confidence, precision) {
                warn!("参数调整被拒绝: {e}");
            } else {
                debug!(
                    ?frame_skip, ?confidence, ?precision,
                    "运行时参数已更新"
                );
            }
        }
    }
}

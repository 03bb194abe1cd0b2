//! 流会话
//!
//! 管线与WebSocket连接之间的扇出层。发布侧为单槽替换语义：
//! 管线每个周期覆盖写入最新消息，慢客户端只会错过中间帧，
//! 永远不会让发布侧阻塞或积压。终止消息作为槽位最后的值保留，
//! 晚到的订阅者也能收到。

use common::ServerMessage;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// 会话状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 已创建，尚未收到任何消息
    Idle,
    /// 正常收帧
    Open,
    /// 已收到终止消息，等待连接关闭
    Draining,
    /// 连接已关闭
    Closed,
}

/// 发布端（管线持有）
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: watch::Sender<Option<Arc<ServerMessage>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// 覆盖写入最新消息（替换未被消费的旧值）
    ///
    /// 用send_replace而非send：即使当前没有订阅者，槽位也要保留
    /// 最新值，晚到的客户端才能看到终止消息。
    pub fn publish(&self, msg: ServerMessage) {
        self.tx.send_replace(Some(Arc::new(msg)));
    }

    /// 清空槽位（新源启动时调用，避免新连接收到上一条流的终止消息）
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// 创建新会话
    ///
    /// 若槽位当前为终止消息（流已结束），该消息会作为会话的
    /// 第一条消息投递，保证晚到/重连的客户端得到收尾。
    pub fn subscribe(&self) -> StreamSession {
        let rx = self.tx.subscribe();
        let pending_terminal = rx
            .borrow()
            .as_ref()
            .filter(|m| m.is_terminal())
            .map(Arc::clone);
        StreamSession {
            id: Uuid::new_v4(),
            rx,
            pending_terminal,
            state: SessionState::Idle,
            last_seq: None,
            frames_sent: 0,
            frames_dropped: 0,
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个客户端连接的接收会话
///
/// 通过广播序号的跳变统计该连接因背压错过的帧数。
pub struct StreamSession {
    id: Uuid,
    rx: watch::Receiver<Option<Arc<ServerMessage>>>,
    /// 订阅时槽位中已存在的终止消息（优先投递）
    pending_terminal: Option<Arc<ServerMessage>>,
    state: SessionState,
    last_seq: Option<u64>,
    frames_sent: u64,
    frames_dropped: u64,
}

impl StreamSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// 因单槽替换被跳过的帧数（序号缺口累计）
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// 取下一条待发送消息
    ///
    /// 返回None表示发布端已销毁（服务停止），会话转入Closed。
    /// 收到终止消息后会话转入Draining，调用方发送完该消息后
    /// 应调用`close`并关闭连接。
    pub async fn next_message(&mut self) -> Option<Arc<ServerMessage>> {
        if let Some(msg) = self.pending_terminal.take() {
            self.state = SessionState::Draining;
            return Some(msg);
        }
        if matches!(self.state, SessionState::Draining | SessionState::Closed) {
            return None;
        }

        loop {
            if self.rx.changed().await.is_err() {
                self.state = SessionState::Closed;
                return None;
            }
            let msg = match self.rx.borrow_and_update().as_ref() {
                Some(msg) => Arc::clone(msg),
                // clear()写入的None，继续等待
                None => continue,
            };

            if let Some(seq) = msg.seq {
                if let Some(last) = self.last_seq {
                    if seq > last + 1 {
                        self.frames_dropped += seq - last - 1;
                    }
                }
                self.last_seq = Some(seq);
                self.frames_sent += 1;
            }

            self.state = if msg.is_terminal() {
                SessionState::Draining
            } else {
                SessionState::Open
            };
            return Some(msg);
        }
    }

    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            debug!(
                session = %self.id,
                sent = self.frames_sent,
                dropped = self.frames_dropped,
                "会话关闭"
            );
            self.state = SessionState::Closed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CounterSet, StreamStatus};

    fn frame_msg(seq: u64) -> ServerMessage {
        ServerMessage {
            seq: Some(seq),
            frame: Some("AAAA".to_string()),
            is_running: Some(true),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_subscriber_count_tracks_sessions() {
        let broadcaster = Broadcaster::new();
        assert_eq!(broadcaster.subscriber_count(), 0);

        let first = broadcaster.subscribe();
        let second = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        drop(first);
        drop(second);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_burst_delivers_only_latest() {
        let broadcaster = Broadcaster::new();
        let mut session = broadcaster.subscribe();

        // 发布侧连发5条，慢客户端只看到最后一条
        for seq in 1..=5 {
            broadcaster.publish(frame_msg(seq));
        }
        let msg = session.next_message().await.unwrap();
        assert_eq!(msg.seq, Some(5));
        assert_eq!(session.frames_sent(), 1);
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn test_drop_accounting_from_seq_gaps() {
        let broadcaster = Broadcaster::new();
        let mut session = broadcaster.subscribe();

        broadcaster.publish(frame_msg(1));
        session.next_message().await.unwrap();

        // 序号2-4被替换，仅5到达
        for seq in 2..=5 {
            broadcaster.publish(frame_msg(seq));
        }
        session.next_message().await.unwrap();

        assert_eq!(session.frames_sent(), 2);
        assert_eq!(session.frames_dropped(), 3);
    }

    #[tokio::test]
    async fn test_terminal_transitions_to_draining() {
        let broadcaster = Broadcaster::new();
        let mut session = broadcaster.subscribe();

        broadcaster.publish(ServerMessage::complete(CounterSet::default()));
        let msg = session.next_message().await.unwrap();
        assert_eq!(msg.status, Some(StreamStatus::Complete));
        assert_eq!(session.state(), SessionState::Draining);

        // 终止之后不再投递
        assert!(session.next_message().await.is_none());
    }

    #[tokio::test]
    async fn test_late_subscriber_receives_terminal() {
        let broadcaster = Broadcaster::new();
        broadcaster.publish(frame_msg(10));
        broadcaster.publish(ServerMessage::stopped(CounterSet::default(), None));

        // 流结束后才连上的客户端
        let mut session = broadcaster.subscribe();
        let msg = session.next_message().await.unwrap();
        assert_eq!(msg.status, Some(StreamStatus::Stopped));
        assert_eq!(session.state(), SessionState::Draining);
    }

    #[tokio::test]
    async fn test_late_subscriber_skips_stale_frame() {
        let broadcaster = Broadcaster::new();
        broadcaster.publish(frame_msg(10));

        // 订阅时槽位里的普通帧视为已消费，只等新帧
        let mut session = broadcaster.subscribe();
        broadcaster.publish(frame_msg(11));
        let msg = session.next_message().await.unwrap();
        assert_eq!(msg.seq, Some(11));
    }

    #[tokio::test]
    async fn test_clear_resets_slot_for_new_stream() {
        let broadcaster = Broadcaster::new();
        broadcaster.publish(ServerMessage::complete(CounterSet::default()));
        broadcaster.clear();

        let mut session = broadcaster.subscribe();
        broadcaster.publish(frame_msg(1));
        let msg = session.next_message().await.unwrap();
        assert_eq!(msg.seq, Some(1));
        assert!(!msg.is_terminal());
    }

    #[tokio::test]
    async fn test_sender_drop_closes_session() {
        let broadcaster = Broadcaster::new();
        let mut session = broadcaster.subscribe();
        drop(broadcaster);

        assert!(session.next_message().await.is_none());
        assert_eq!(session.state(), SessionState::Closed);
    }
}

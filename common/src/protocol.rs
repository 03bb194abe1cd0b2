use crate::types::*;
use serde::{Deserialize, Serialize};

/// 流终止状态
///
/// 带status的消息是该连接的终止消息，之后不再有帧。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// 显式停止或致命错误
    Stopped,
    /// 文件源正常播放完毕
    Complete,
}

/// 服务端→客户端消息（每个逻辑周期一条）
///
/// 所有字段可选：帧每周期发送（受背压约束），完整元数据按固定节拍
/// 每第K个周期发送一次以控制带宽。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    /// 广播序号（单调递增，客户端用于统计丢帧）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Base64编码的JPEG帧
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counts: Option<CounterSet>,
    /// 每帧车辆数时间线（有界环形缓冲的当前内容）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_stats: Option<TrackingStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perf: Option<PerfStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_detected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<SourceKind>,
    /// 终止状态（出现即为该连接最后一条消息）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StreamStatus>,
    /// 致命错误说明（仅在status=stopped且异常终止时出现）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerMessage {
    /// 是否为终止消息
    pub fn is_terminal(&self) -> bool {
        self.status.is_some()
    }

    /// 构造正常完成的终止消息
    pub fn complete(counts: CounterSet) -> Self {
        let total = counts.total();
        Self {
            status: Some(StreamStatus::Complete),
            total_detected: Some(total),
            counts: Some(counts),
            is_running: Some(false),
            ..Default::default()
        }
    }

    /// 构造停止终止消息（error为None表示显式停止）
    pub fn stopped(counts: CounterSet, error: Option<String>) -> Self {
        let total = counts.total();
        Self {
            status: Some(StreamStatus::Stopped),
            total_detected: Some(total),
            counts: Some(counts),
            is_running: Some(false),
            error,
            ..Default::default()
        }
    }
}

/// 客户端命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientCommand {
    Stop,
}

/// 客户端→服务端消息（仅控制，不回传媒体）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    /// 命令：{"command": "stop"}
    Command { command: ClientCommand },
    /// 运行时参数调整：{"frame_skip": 2, "confidence": 0.5, "precision": "high"}
    /// 下一次推理生效，不会打断进行中的推理。
    Control {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frame_skip: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        precision: Option<PrecisionLevel>,
    },
}

/// 启动源请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSourceRequest {
    #[serde(flatten)]
    pub descriptor: SourceDescriptor,
}

/// 启动源响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSourceResponse {
    pub source_type: SourceKind,
    /// 是否从持久化计数恢复
    pub resumed: bool,
    /// 初始计数（恢复会话为持久化值，否则为零）
    pub counts: CounterSet,
    /// RTSP协商成功的传输方式（"TCP"/"UDP"）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_frames: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
}

/// 停止响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub final_counts: CounterSet,
    pub total_detected: u64,
}

/// 连通性探测响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub reachable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 聚合统计快照（REST查询用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub counts: CounterSet,
    pub timeline: Vec<u32>,
    pub frame_count: u64,
    pub is_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<SourceKind>,
    pub total_detected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_omits_empty_fields() {
        let msg = ServerMessage {
            seq: Some(7),
            frame: Some("AAAA".to_string()),
            is_running: Some(true),
            ..Default::default()
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"seq\":7"));
        assert!(json.contains("\"frame\""));
        assert!(!json.contains("counts"));
        assert!(!json.contains("status"));
    }

    #[test]
    fn test_terminal_message() {
        let counts = CounterSet {
            car: 3,
            ..Default::default()
        };
        let msg = ServerMessage::complete(counts.clone());
        assert!(msg.is_terminal());
        assert_eq!(msg.status, Some(StreamStatus::Complete));
        assert_eq!(msg.counts, Some(counts));
        assert_eq!(msg.total_detected, Some(3));

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"status\":\"complete\""));
    }

    #[test]
    fn test_stopped_with_error() {
        let msg = ServerMessage::stopped(CounterSet::default(), Some("source faulted".into()));
        assert!(msg.is_terminal());
        assert_eq!(msg.status, Some(StreamStatus::Stopped));
        assert!(msg.error.is_some());
    }

    #[test]
    fn test_client_message_stop_command() {
        let parsed: ClientMessage = serde_json::from_str(r#"{"command":"stop"}"#).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Command {
                command: ClientCommand::Stop
            }
        );
    }

    #[test]
    fn test_client_message_control_update() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"frame_skip":3,"confidence":0.45,"precision":"high"}"#)
                .unwrap();
        match parsed {
            ClientMessage::Control {
                frame_skip,
                confidence,
                precision,
            } => {
                assert_eq!(frame_skip, Some(3));
                assert_eq!(confidence, Some(0.45));
                assert_eq!(precision, Some(PrecisionLevel::High));
            }
            other => panic!("Expected control update, got {:?}", other),
        }
    }

    #[test]
    fn test_client_message_partial_control() {
        // 只带一个字段也是合法的控制消息
        let parsed: ClientMessage = serde_json::from_str(r#"{"confidence":0.6}"#).unwrap();
        match parsed {
            ClientMessage::Control {
                frame_skip,
                confidence,
                ..
            } => {
                assert_eq!(frame_skip, None);
                assert_eq!(confidence, Some(0.6));
            }
            other => panic!("Expected control update, got {:?}", other),
        }
    }
}

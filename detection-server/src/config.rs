use anyhow::Result;
use common::PrecisionLevel;
use std::path::PathBuf;
use std::time::Duration;

/// 服务端配置
///
/// 默认值面向交通CCTV场景调优，少量参数可通过环境变量覆盖。
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    // ── 推理 ──────────────────────────────────────
    /// 默认置信度阈值（偏低以捕捉远处小目标）
    pub confidence: f32,
    /// 默认精度档位
    pub precision: PrecisionLevel,
    /// 跳帧间隔：每N帧推理一帧，其余帧沿用上次标注
    pub frame_skip: u32,

    // ── 帧率控制 ──────────────────────────────────
    /// 目标处理帧率（处理循环的节拍）
    pub infer_fps: f64,
    /// 每第N个广播周期附带完整元数据
    pub meta_every_n: u64,

    // ── 编码 ──────────────────────────────────────
    /// JPEG编码质量（0-100）
    pub jpeg_quality: u8,
    /// 标注帧编码前的最大宽度
    pub frame_resize_width: u32,

    // ── 聚合 ──────────────────────────────────────
    /// 时间线环形缓冲容量
    pub timeline_cap: usize,
    /// 速度推算标定：像素/米
    pub pixels_per_meter: f64,

    // ── 持久化 ────────────────────────────────────
    pub db_path: PathBuf,
    /// 每处理N帧自动落库一次
    pub save_interval_frames: u64,

    // ── 容错 ──────────────────────────────────────
    /// 连续读取失败预算，超过即视为致命错误
    pub read_retry_budget: u32,
    /// 单次源读取的超时上限（阻塞读必须可在此时间内取消）
    pub read_timeout: Duration,
    /// 源打开（含RTSP协商）超时
    pub open_timeout: Duration,
    /// 文件源无内嵌时间信息时的假定帧率
    pub file_fps: f64,
}

impl ServerConfig {
    pub fn load() -> Result<Self> {
        let host = std::env::var("DETECTION_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = std::env::var("DETECTION_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8000);
        let db_path = std::env::var("DETECTION_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("detection_counts.db"));

        Ok(Self {
            host,
            port,
            confidence: 0.30,
            precision: PrecisionLevel::Low,
            frame_skip: 2,
            infer_fps: 12.0,
            meta_every_n: 5,
            jpeg_quality: 75,
            frame_resize_width: 960,
            timeline_cap: 100,
            pixels_per_meter: 50.0,
            db_path,
            save_interval_frames: 60,
            read_retry_budget: 3,
            read_timeout: Duration::from_secs(5),
            open_timeout: Duration::from_secs(10),
            file_fps: 25.0,
        })
    }

    /// 广播节拍对应的周期时长
    pub fn cycle_interval(&self) -> Duration {
        if self.infer_fps > 0.0 {
            Duration::from_secs_f64(1.0 / self.infer_fps)
        } else {
            Duration::from_millis(83)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::load().unwrap();
        assert_eq!(config.timeline_cap, 100);
        assert_eq!(config.frame_skip, 2);
        assert_eq!(config.read_retry_budget, 3);
        assert_eq!(config.meta_every_n, 5);
        assert!(config.confidence > 0.0 && config.confidence < 1.0);
    }

    #[test]
    fn test_cycle_interval() {
        let mut config = ServerConfig::load().unwrap();
        config.infer_fps = 10.0;
        assert_eq!(config.cycle_interval(), Duration::from_millis(100));
    }
}

use anyhow::Result;
use common::PrecisionLevel;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    /// Display refresh rate, independent of the server's send cadence
    pub render_fps: f64,

    // Reconnect policy: delay(k) = min(base * growth^k, cap)
    pub reconnect_base: Duration,
    pub reconnect_growth: f64,
    pub reconnect_cap: Duration,
    pub max_reconnect: u32,

    // Optional runtime overrides sent once after connecting
    pub frame_skip: Option<u32>,
    pub confidence: Option<f32>,
    pub precision: Option<PrecisionLevel>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let server_host =
            std::env::var("DASHBOARD_SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = std::env::var("DASHBOARD_SERVER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8000);

        Ok(Self {
            server_host,
            server_port,
            render_fps: 30.0,
            reconnect_base: Duration::from_secs(1),
            reconnect_growth: 2.0,
            reconnect_cap: Duration::from_secs(15),
            max_reconnect: 5,
            frame_skip: None,
            confidence: None,
            precision: None,
        })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws/video", self.server_host, self.server_port)
    }

    pub fn render_interval(&self) -> Duration {
        if self.render_fps > 0.0 {
            Duration::from_secs_f64(1.0 / self.render_fps)
        } else {
            Duration::from_millis(33)
        }
    }
}

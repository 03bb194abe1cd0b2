//! WebSocket client loop
//!
//! Connects to the detection server's /ws/video endpoint, feeds incoming
//! frames through the render scheduler, and reconnects with backoff when
//! the connection drops. A terminal stream message ends the run cleanly
//! without scheduling a reconnect.

use crate::config::Config;
use crate::reconnect::ReconnectCoordinator;
use crate::render::{PendingFrame, RenderScheduler};
use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use common::{ClientMessage, ProtocolError, ServerMessage};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum SessionEnd {
    /// Server sent a terminal message; the stream is over
    Terminal,
    /// Transport dropped mid-stream; eligible for reconnect
    ConnectionLost,
    Cancelled,
}

pub struct DashboardClient {
    config: Config,
}

impl DashboardClient {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut coordinator = ReconnectCoordinator::new(
            self.config.reconnect_base,
            self.config.reconnect_growth,
            self.config.reconnect_cap,
            self.config.max_reconnect,
        );
        let url = self.config.ws_url();

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let connect = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                c = connect_async(&url) => c,
            };

            match connect {
                Ok((stream, _)) => {
                    coordinator.on_connected();
                    info!("📡 Connected to {url}");
                    match self.run_session(stream, &cancel).await {
                        SessionEnd::Terminal => {
                            info!("Stream finished, exiting");
                            return Ok(());
                        }
                        SessionEnd::Cancelled => return Ok(()),
                        SessionEnd::ConnectionLost => {
                            warn!("Connection lost");
                            coordinator.on_disconnected();
                        }
                    }
                }
                Err(e) => {
                    warn!("Connect failed: {e}");
                    coordinator.on_disconnected();
                }
            }

            match coordinator.next_attempt() {
                Some(delay) => {
                    info!(
                        "Reconnecting in {:.1}s (attempt {}/{})",
                        delay.as_secs_f64(),
                        coordinator.attempt(),
                        self.config.max_reconnect
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    error!(
                        "❌ Gave up after {} reconnect attempts",
                        self.config.max_reconnect
                    );
                    anyhow::bail!("reconnect budget exhausted");
                }
            }
        }
    }

    async fn run_session(&self, stream: WsStream, cancel: &CancellationToken) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        // Push any configured runtime overrides once per connection
        if let Some(control) = self.control_overrides() {
            let text = match serde_json::to_string(&control) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode control message: {e}");
                    return SessionEnd::ConnectionLost;
                }
            };
            if write.send(Message::Text(text)).await.is_err() {
                return SessionEnd::ConnectionLost;
            }
        }

        let mut scheduler = RenderScheduler::new();
        let mut ticker = interval(self.config.render_interval());
        let mut terminal_seen = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                _ = ticker.tick() => {
                    if let Some(frame) = scheduler.commit() {
                        let displayed_terminal = frame.message.is_terminal();
                        self.present(&mut scheduler, frame);
                        if displayed_terminal {
                            return SessionEnd::Terminal;
                        }
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if terminal_seen {
                                warn!("{}", ProtocolError::AfterTerminal);
                                continue;
                            }
                            match parse_server_message(&text) {
                                Ok(msg) => {
                                    if msg.is_terminal() {
                                        terminal_seen = true;
                                        report_terminal(&msg);
                                    }
                                    scheduler.submit(Arc::new(msg));
                                }
                                Err(e) => warn!("Dropping server message: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return if terminal_seen {
                                SessionEnd::Terminal
                            } else {
                                SessionEnd::ConnectionLost
                            };
                        }
                        Some(Ok(_)) => {} // ping/pong
                        Some(Err(e)) => {
                            debug!("Read error: {e}");
                            return if terminal_seen {
                                SessionEnd::Terminal
                            } else {
                                SessionEnd::ConnectionLost
                            };
                        }
                    }
                }
            }
        }
    }

    fn control_overrides(&self) -> Option<ClientMessage> {
        if self.config.frame_skip.is_none()
            && self.config.confidence.is_none()
            && self.config.precision.is_none()
        {
            return None;
        }
        Some(ClientMessage::Control {
            frame_skip: self.config.frame_skip,
            confidence: self.config.confidence,
            precision: self.config.precision,
        })
    }

    /// Headless "display": decode the frame and log what a UI would draw
    fn present(&self, scheduler: &mut RenderScheduler, frame: PendingFrame) {
        let msg = &frame.message;
        let frame_bytes = msg
            .frame
            .as_deref()
            .and_then(|f| BASE64.decode(f).ok())
            .map(|b| b.len())
            .unwrap_or(0);
        let latency_ms = scheduler
            .last_latency()
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        debug!(
            seq = msg.seq,
            bytes = frame_bytes,
            latency_ms = format!("{latency_ms:.1}"),
            fps = scheduler.fps(Instant::now()),
            "frame displayed"
        );

        if let Some(counts) = &msg.counts {
            debug!(
                "🚗 totals: car={} motorcycle={} bus={} truck={}",
                counts.car, counts.motorcycle, counts.bus, counts.truck
            );
        }
    }
}

fn parse_server_message(text: &str) -> common::Result<ServerMessage> {
    Ok(serde_json::from_str(text)?)
}

fn report_terminal(msg: &ServerMessage) {
    match &msg.error {
        Some(error) => warn!("Stream stopped by server: {error}"),
        None => info!(
            "Stream ended, {} vehicles detected in total",
            msg.total_detected.unwrap_or(0)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CounterSet, StreamStatus};

    #[test]
    fn test_parse_frame_message() {
        let text = r#"{"seq":12,"frame":"QUJD","is_running":true}"#;
        let msg = parse_server_message(text).unwrap();
        assert_eq!(msg.seq, Some(12));
        assert!(!msg.is_terminal());
        assert_eq!(BASE64.decode(msg.frame.unwrap()).unwrap(), b"ABC");
    }

    #[test]
    fn test_parse_terminal_message() {
        let text = serde_json::to_string(&ServerMessage::stopped(
            CounterSet::default(),
            Some("source faulted".to_string()),
        ))
        .unwrap();
        let msg = parse_server_message(&text).unwrap();
        assert!(msg.is_terminal());
        assert_eq!(msg.status, Some(StreamStatus::Stopped));
        assert_eq!(msg.error.as_deref(), Some("source faulted"));
    }

    #[test]
    fn test_parse_garbage_returns_none() {
        assert!(parse_server_message("not json").is_err());
    }

    #[test]
    fn test_control_overrides_round_trip() {
        let mut config = Config::load().unwrap();
        config.frame_skip = Some(3);
        config.confidence = Some(0.5);
        let client = DashboardClient::new(config);

        let control = client.control_overrides().unwrap();
        let json = serde_json::to_string(&control).unwrap();
        assert!(json.contains("\"frame_skip\":3"));
        assert!(json.contains("\"confidence\":0.5"));
        assert!(!json.contains("precision"));
    }

    #[test]
    fn test_no_overrides_sends_nothing() {
        let client = DashboardClient::new(Config::load().unwrap());
        assert!(client.control_overrides().is_none());
    }
}

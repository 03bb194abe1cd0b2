mod client;
mod config;
mod reconnect;
mod render;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志 - 使用环境变量 RUST_LOG 控制级别
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("📊 Dashboard client starting...");

    let config = config::Config::load()?;
    info!("✓ Configuration loaded");
    info!("  Server: {}", config.ws_url());
    info!("  Render fps: {}", config.render_fps);

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            ctrl_c_cancel.cancel();
        }
    });

    info!("✅ Dashboard client ready!");
    info!("   Press Ctrl+C to stop");

    let client = client::DashboardClient::new(config);
    client.run(cancel).await
}

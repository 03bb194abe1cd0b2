mod aggregate;
mod annotate;
mod api;
mod config;
mod detect;
mod pipeline;
mod session;
mod source;
mod store;

use anyhow::Result;
use detect::NullDetector;
use pipeline::PipelineSupervisor;
use std::sync::Arc;
use store::{CounterStore, SqliteCounterStore};
use tracing::{info, warn, Level};
use tracing_subscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .init();

    info!("🚀 Detection server starting...");

    // 加载配置
    let config = config::ServerConfig::load()?;
    info!("✓ Configuration loaded");

    // 打开计数存储，文件不可用时降级为内存模式
    let store: Arc<dyn CounterStore> = match SqliteCounterStore::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!("Failed to open counter database: {e}");
            Arc::new(SqliteCounterStore::open_in_memory()?)
        }
    };

    // 模型后端尚未接入时使用空实现，管线其余部分照常工作
    let detector = Arc::new(NullDetector);
    let supervisor = Arc::new(PipelineSupervisor::new(config.clone(), detector, store));
    info!("✓ Pipeline supervisor initialized");

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("✓ HTTP server listening on {}", addr);

    let router = api::create_router(Arc::clone(&supervisor));
    info!("✅ Detection server ready!");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(supervisor))
        .await?;

    Ok(())
}

/// Ctrl+C时先停掉活动流（落库收尾），再退出
async fn shutdown_signal(supervisor: Arc<PipelineSupervisor>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        return;
    }
    info!("Shutdown signal received, stopping pipeline...");
    if let Err(e) = supervisor.stop().await {
        warn!("Pipeline stop during shutdown failed: {e}");
    }
}

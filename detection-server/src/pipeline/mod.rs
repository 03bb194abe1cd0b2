//! 检测管线
//!
//! 单一活动源的拉帧→推理→聚合→广播循环，由PipelineSupervisor
//! 统一管理生命周期。启动新源会先隐式停止当前源；读取失败按
//! 连续预算重试，超限进入Faulted并广播带错误说明的终止消息。

use crate::aggregate::AggregationState;
use crate::annotate::annotate_jpeg;
use crate::config::ServerConfig;
use crate::detect::{DetectionStage, Detector};
use crate::session::Broadcaster;
use crate::source::{
    scan_devices, DeviceInfo, DeviceSource, FileSource, FrameSource, RtspSource, SourceError,
};
use crate::store::CounterStore;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use common::{
    CounterSet, PrecisionLevel, ProbeResponse, ServerMessage, SourceDescriptor, SourceKind,
    StartSourceResponse, StatsSnapshot, StopResponse,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to open source: {0}")]
    Source(#[from] SourceError),

    #[error("Source open timed out")]
    OpenTimeout,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// 管线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// 读取失败超预算后的终态，需显式启动新源才能离开
    Faulted,
}

/// 运行时可调参数
///
/// 通过watch通道下发到处理循环，下一个推理周期生效。
#[derive(Debug, Clone, Copy)]
pub struct RuntimeSettings {
    /// 每N帧推理一帧（1=逐帧）
    pub frame_skip: u32,
    pub confidence: f32,
    pub precision: PrecisionLevel,
}

/// 活动流的任务句柄
struct ActiveStream {
    descriptor: SourceDescriptor,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    /// 任务自然结束（播放完毕/故障）时置位，收尾已由任务完成
    finished: Arc<AtomicBool>,
}

struct Core {
    active: Option<ActiveStream>,
}

/// 管线监督器
///
/// 持有唯一活动流的生命周期，所有启停经过内部互斥锁串行化，
/// 并发的启动/停止请求不会交错。
pub struct PipelineSupervisor {
    config: ServerConfig,
    stage: DetectionStage,
    store: Arc<dyn CounterStore>,
    broadcaster: Broadcaster,
    settings: watch::Sender<RuntimeSettings>,
    state: Arc<StdMutex<PipelineState>>,
    aggregation: Arc<StdMutex<AggregationState>>,
    core: Mutex<Core>,
}

impl PipelineSupervisor {
    pub fn new(
        config: ServerConfig,
        detector: Arc<dyn Detector>,
        store: Arc<dyn CounterStore>,
    ) -> Self {
        let (settings, _) = watch::channel(RuntimeSettings {
            frame_skip: config.frame_skip,
            confidence: config.confidence,
            precision: config.precision,
        });
        let aggregation = Arc::new(StdMutex::new(AggregationState::new(
            config.timeline_cap,
            config.pixels_per_meter,
        )));
        Self {
            stage: DetectionStage::new(detector),
            store,
            broadcaster: Broadcaster::new(),
            settings,
            state: Arc::new(StdMutex::new(PipelineState::Stopped)),
            aggregation,
            core: Mutex::new(Core { active: None }),
            config,
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap()
    }

    /// 调整运行时参数（缺省字段保持不变）
    ///
    /// 返回InvalidParameter时所有参数均未生效。
    pub fn apply_settings(
        &self,
        frame_skip: Option<u32>,
        confidence: Option<f32>,
        precision: Option<PrecisionLevel>,
    ) -> Result<()> {
        if let Some(skip) = frame_skip {
            if skip == 0 {
                return Err(PipelineError::InvalidParameter(
                    "frame_skip must be >= 1".to_string(),
                ));
            }
        }
        if let Some(conf) = confidence {
            if !(0.0..=1.0).contains(&conf) || conf == 0.0 {
                return Err(PipelineError::InvalidParameter(
                    "confidence must be in (0.0, 1.0]".to_string(),
                ));
            }
        }

        self.settings.send_modify(|s| {
            if let Some(skip) = frame_skip {
                s.frame_skip = skip;
            }
            if let Some(conf) = confidence {
                s.confidence = conf;
            }
            if let Some(p) = precision {
                s.precision = p;
            }
        });
        Ok(())
    }

    pub fn current_settings(&self) -> RuntimeSettings {
        *self.settings.borrow()
    }

    /// 聚合统计快照
    pub async fn stats(&self) -> StatsSnapshot {
        let source_type = {
            let core = self.core.lock().await;
            core.active.as_ref().map(|a| a.descriptor.kind)
        };
        let agg = self.aggregation.lock().unwrap();
        StatsSnapshot {
            counts: agg.snapshot(),
            timeline: agg.timeline(),
            frame_count: agg.frame_count(),
            is_running: self.state() == PipelineState::Running,
            source_type,
            total_detected: agg.total_detected(),
        }
    }

    /// 启动新源
    ///
    /// 当前有活动流时先隐式停止（含落库）。携带camera_id且存储中
    /// 有记录时从持久化计数恢复，否则计数清零。
    pub async fn start(&self, descriptor: SourceDescriptor) -> Result<StartSourceResponse> {
        let mut core = self.core.lock().await;
        self.stop_locked(&mut core).await;

        self.set_state(PipelineState::Starting);
        info!("🚀 启动检测源: {} ({})", descriptor.locator, descriptor.kind);

        let source = match timeout(self.config.open_timeout, self.open_source(&descriptor)).await {
            Ok(Ok(source)) => source,
            Ok(Err(e)) => {
                self.set_state(PipelineState::Stopped);
                return Err(e.into());
            }
            Err(_) => {
                self.set_state(PipelineState::Stopped);
                return Err(PipelineError::OpenTimeout);
            }
        };
        let info = source.info();

        // 恢复持久化计数。存储读失败只告警，不阻断启动
        let restored = match &descriptor.camera_id {
            Some(camera_id) => {
                let store = Arc::clone(&self.store);
                let id = camera_id.clone();
                match tokio::task::spawn_blocking(move || store.load(&id)).await {
                    Ok(Ok(restored)) => restored,
                    Ok(Err(e)) => {
                        warn!("读取持久化计数失败，按新会话启动: {}", e);
                        None
                    }
                    Err(e) => {
                        warn!("读取持久化计数失败，按新会话启动: {}", e);
                        None
                    }
                }
            }
            None => None,
        };
        let resumed = restored.is_some();
        let counts = restored.unwrap_or_default();

        {
            let mut agg = self.aggregation.lock().unwrap();
            agg.reset();
            agg.restore(counts.clone());
        }
        self.broadcaster.clear();

        let ctx = IngestCtx {
            config: self.config.clone(),
            stage: self.stage.clone(),
            store: Arc::clone(&self.store),
            broadcaster: self.broadcaster.clone(),
            aggregation: Arc::clone(&self.aggregation),
            state: Arc::clone(&self.state),
            settings: self.settings.subscribe(),
            descriptor: descriptor.clone(),
            cancel: CancellationToken::new(),
            finished: Arc::new(AtomicBool::new(false)),
        };
        let cancel = ctx.cancel.clone();
        let finished = Arc::clone(&ctx.finished);
        let task = tokio::spawn(run_ingest(ctx, source));

        core.active = Some(ActiveStream {
            descriptor: descriptor.clone(),
            cancel,
            task,
            finished,
        });
        self.set_state(PipelineState::Running);

        if resumed {
            info!(
                "✓ 恢复会话 camera_id={:?}，累计{}辆",
                descriptor.camera_id,
                counts.total()
            );
        }

        Ok(StartSourceResponse {
            source_type: info.kind,
            resumed,
            counts,
            transport: info.transport,
            total_frames: info.total_frames,
            fps: info.fps,
        })
    }

    /// 停止当前流（幂等：无活动流时返回当前计数）
    pub async fn stop(&self) -> Result<StopResponse> {
        let mut core = self.core.lock().await;
        self.stop_locked(&mut core).await;

        let counts = self.aggregation.lock().unwrap().snapshot();
        let total_detected = counts.total();
        Ok(StopResponse {
            final_counts: counts,
            total_detected,
        })
    }

    /// 停止活动流（已持有core锁）
    ///
    /// 任务被取消时由本方法补发终止消息并落库；任务已自然结束
    /// （播放完毕或故障）时收尾早已完成，这里只回收句柄。
    async fn stop_locked(&self, core: &mut Core) {
        let Some(active) = core.active.take() else {
            return;
        };

        let prior = self.state();
        self.set_state(PipelineState::Stopping);
        active.cancel.cancel();
        if let Err(e) = active.task.await {
            error!("处理任务异常退出: {e}");
        }

        // 任务自然结束时终止消息与落库已由任务完成，这里只回收句柄；
        // 此处读取在task.await之后，与任务的置位无竞争
        if active.finished.load(Ordering::Acquire) {
            // 保留任务写入的终态（Stopped或Faulted）
            self.set_state(match self.state() {
                PipelineState::Stopping => prior,
                s => s,
            });
            return;
        }

        let counts = self.aggregation.lock().unwrap().snapshot();
        self.broadcaster
            .publish(ServerMessage::stopped(counts.clone(), None));
        persist(&self.store, &active.descriptor, counts).await;
        self.set_state(PipelineState::Stopped);
        info!("✅ 检测源已停止: {}", active.descriptor.locator);
    }

    /// 连通性探测（不影响活动流）
    pub async fn probe(&self, url: &str) -> ProbeResponse {
        match RtspSource::probe(url, self.config.open_timeout).await {
            Ok(transport) => ProbeResponse {
                reachable: true,
                transport: Some(transport),
                error: None,
            },
            Err(e) => ProbeResponse {
                reachable: false,
                transport: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// 枚举本机采集设备
    pub fn devices(&self) -> Vec<DeviceInfo> {
        scan_devices()
    }

    async fn open_source(
        &self,
        descriptor: &SourceDescriptor,
    ) -> std::result::Result<Box<dyn FrameSource>, SourceError> {
        match descriptor.kind {
            SourceKind::File => {
                let source = FileSource::open(&descriptor.locator, self.config.file_fps).await?;
                Ok(Box::new(source))
            }
            SourceKind::Rtsp => {
                let source =
                    RtspSource::open(&descriptor.locator, self.config.open_timeout).await?;
                Ok(Box::new(source))
            }
            SourceKind::Device => {
                let index: usize = descriptor.locator.parse().map_err(|_| {
                    SourceError::InvalidLocator(format!(
                        "device index expected, got {:?}",
                        descriptor.locator
                    ))
                })?;
                let source = DeviceSource::open(index).await?;
                Ok(Box::new(source))
            }
        }
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.lock().unwrap() = state;
    }
}

/// 处理循环上下文
struct IngestCtx {
    config: ServerConfig,
    stage: DetectionStage,
    store: Arc<dyn CounterStore>,
    broadcaster: Broadcaster,
    aggregation: Arc<StdMutex<AggregationState>>,
    state: Arc<StdMutex<PipelineState>>,
    settings: watch::Receiver<RuntimeSettings>,
    descriptor: SourceDescriptor,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
}

/// 拉帧→推理→聚合→广播循环
///
/// 自然结束路径（播放完毕/故障）在此完成收尾：广播终止消息、
/// 落库、写入终态。被取消时不做任何收尾，由stop补发。
async fn run_ingest(mut ctx: IngestCtx, mut source: Box<dyn FrameSource>) {
    let mut ticker = interval(ctx.config.cycle_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut consecutive_failures: u32 = 0;
    let mut last_detections: Vec<common::Detection> = Vec::new();
    let mut broadcast_seq: u64 = 0;
    let mut last_infer_at: Option<Instant> = None;
    let mut last_infer_ms: f64 = 0.0;
    // 最近1秒内广播时刻，用于实际帧率
    let mut sent_at: VecDeque<Instant> = VecDeque::new();

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                source.close().await;
                return;
            }
            _ = ticker.tick() => {}
        }

        let read = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                source.close().await;
                return;
            }
            r = timeout(ctx.config.read_timeout, source.next_frame()) => r,
        };

        let frame = match read {
            Err(_) => {
                consecutive_failures += 1;
                warn!(
                    "源读取超时（连续第{}次，预算{}）",
                    consecutive_failures, ctx.config.read_retry_budget
                );
                if consecutive_failures >= ctx.config.read_retry_budget {
                    finish_faulted(&ctx, &mut source, SourceError::ReadTimeout).await;
                    return;
                }
                continue;
            }
            Ok(Err(e)) => {
                consecutive_failures += 1;
                warn!(
                    "源读取失败: {e}（连续第{}次，预算{}）",
                    consecutive_failures, ctx.config.read_retry_budget
                );
                if consecutive_failures >= ctx.config.read_retry_budget {
                    finish_faulted(&ctx, &mut source, e).await;
                    return;
                }
                continue;
            }
            Ok(Ok(None)) => {
                finish_complete(&ctx, &mut source).await;
                return;
            }
            Ok(Ok(Some(frame))) => {
                consecutive_failures = 0;
                frame
            }
        };

        let settings = *ctx.settings.borrow_and_update();
        ctx.aggregation.lock().unwrap().note_frame();

        // 跳帧：首帧必推理，之后每frame_skip帧推理一帧，
        // 其余帧沿用上次检测结果绘制在当前帧上
        let infer_this =
            settings.frame_skip <= 1 || (frame.seq - 1) % settings.frame_skip as u64 == 0;

        let mut tracking = None;
        if infer_this {
            let t0 = Instant::now();
            match ctx
                .stage
                .infer(&frame, settings.confidence, settings.precision)
            {
                Ok(detections) => {
                    last_infer_ms = t0.elapsed().as_secs_f64() * 1000.0;
                    let interval_secs = last_infer_at
                        .map(|t| t.elapsed().as_secs_f64())
                        .unwrap_or(0.0);
                    last_infer_at = Some(t0);
                    last_detections = detections;
                    tracking = Some(
                        ctx.aggregation
                            .lock()
                            .unwrap()
                            .record(&last_detections, interval_secs),
                    );
                }
                // 瞬态：本周期不更新检测与计数，帧照常发送
                Err(e) => warn!("推理失败，跳过本周期标注: {e}"),
            }
        }

        let encoded = match annotate_jpeg(
            &frame.data,
            &last_detections,
            ctx.config.frame_resize_width,
            ctx.config.jpeg_quality,
        ) {
            Ok(jpeg) => jpeg,
            // 解码失败的帧原样透传，客户端仍能显示
            Err(e) => {
                warn!("帧标注失败，透传原始帧: {e}");
                frame.data.to_vec()
            }
        };

        broadcast_seq += 1;
        let now = Instant::now();
        sent_at.push_back(now);
        while let Some(&front) = sent_at.front() {
            if now.duration_since(front).as_secs_f64() > 1.0 {
                sent_at.pop_front();
            } else {
                break;
            }
        }

        let (frame_count, total_detected, counts, timeline) = {
            let agg = ctx.aggregation.lock().unwrap();
            (
                agg.frame_count(),
                agg.total_detected(),
                agg.snapshot(),
                agg.timeline(),
            )
        };

        let mut msg = ServerMessage {
            seq: Some(broadcast_seq),
            frame: Some(BASE64.encode(&encoded)),
            frame_count: Some(frame_count),
            is_running: Some(true),
            ..Default::default()
        };
        // 完整元数据按固定节拍附带，控制带宽
        if broadcast_seq % ctx.config.meta_every_n == 0 {
            msg.counts = Some(counts);
            msg.timeline = Some(timeline);
            msg.tracking_stats = tracking;
            msg.perf = Some(common::PerfStats {
                fps: sent_at.len() as f64,
                infer_ms: last_infer_ms,
            });
            msg.total_detected = Some(total_detected);
            msg.source_type = Some(ctx.descriptor.kind);
        }
        ctx.broadcaster.publish(msg);

        if ctx.config.save_interval_frames > 0 && frame_count % ctx.config.save_interval_frames == 0
        {
            let counts = ctx.aggregation.lock().unwrap().snapshot();
            persist(&ctx.store, &ctx.descriptor, counts).await;
        }
    }
}

/// 文件源播放完毕
async fn finish_complete(ctx: &IngestCtx, source: &mut Box<dyn FrameSource>) {
    source.close().await;
    let counts = ctx.aggregation.lock().unwrap().snapshot();
    info!("✅ 源播放完毕，累计检测{}辆", counts.total());

    let mut msg = ServerMessage::complete(counts.clone());
    msg.frame_count = Some(ctx.aggregation.lock().unwrap().frame_count());
    msg.source_type = Some(ctx.descriptor.kind);
    ctx.broadcaster.publish(msg);

    persist(&ctx.store, &ctx.descriptor, counts).await;
    *ctx.state.lock().unwrap() = PipelineState::Stopped;
    ctx.finished.store(true, Ordering::Release);
}

/// 读取失败超预算
async fn finish_faulted(ctx: &IngestCtx, source: &mut Box<dyn FrameSource>, cause: SourceError) {
    source.close().await;
    let counts = ctx.aggregation.lock().unwrap().snapshot();
    error!("❌ 源故障，停止检测: {cause}");

    ctx.broadcaster
        .publish(ServerMessage::stopped(counts.clone(), Some(cause.to_string())));
    persist(&ctx.store, &ctx.descriptor, counts).await;
    *ctx.state.lock().unwrap() = PipelineState::Faulted;
    ctx.finished.store(true, Ordering::Release);
}

/// 落库（仅携带camera_id的源）
async fn persist(store: &Arc<dyn CounterStore>, descriptor: &SourceDescriptor, counts: CounterSet) {
    let Some(camera_id) = descriptor.camera_id.clone() else {
        return;
    };
    let camera_name = descriptor.camera_name.clone();
    let store = Arc::clone(store);
    let result = tokio::task::spawn_blocking(move || {
        store.save(&camera_id, camera_name.as_deref(), &counts)
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("计数落库失败: {e}"),
        Err(e) => warn!("落库任务异常: {e}"),
    }
}

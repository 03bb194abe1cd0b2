//! 聚合状态
//!
//! 维护单一活动源的累计计数、车辆数时间线与瞬时跟踪统计。
//! 计数在流传输期间单调不减；时间线为有界环形缓冲，
//! 写满后丢弃最旧条目。不做跨帧身份关联。

use common::{CounterSet, Detection, TrackingStats, VehicleClass};
use std::collections::VecDeque;

/// 速度上限（公里/小时），超出视为质心误匹配，截断处理
const MAX_SPEED_KMH: f64 = 200.0;

/// 单源聚合状态
#[derive(Debug)]
pub struct AggregationState {
    counts: CounterSet,
    timeline: VecDeque<u32>,
    timeline_cap: usize,
    frame_count: u64,
    /// 上一推理周期的检测质心（像素坐标）
    prev_centroids: Vec<(f32, f32)>,
    pixels_per_meter: f64,
}

impl AggregationState {
    /// 创建空状态
    ///
    /// 参数:
    ///     timeline_cap: 时间线容量（条目数）
    ///     pixels_per_meter: 像素/米标定系数，用于速度推算
    pub fn new(timeline_cap: usize, pixels_per_meter: f64) -> Self {
        Self {
            counts: CounterSet::default(),
            timeline: VecDeque::with_capacity(timeline_cap),
            timeline_cap,
            frame_count: 0,
            prev_centroids: Vec::new(),
            pixels_per_meter,
        }
    }

    /// 记录读入一帧（含跳过推理的帧）
    pub fn note_frame(&mut self) {
        self.frame_count += 1;
    }

    /// 记录一个推理周期的检测结果
    ///
    /// 每个检测使相应类别计数加一，时间线追加本周期车辆数，
    /// 并基于与上一周期质心的最近邻位移推算瞬时平均速度。
    ///
    /// 参数:
    ///     detections: 本周期通过类别过滤的检测
    ///     interval_secs: 距上一推理周期的时间（秒）
    ///
    /// 返回: 本周期的瞬时跟踪统计
    pub fn record(&mut self, detections: &[Detection], interval_secs: f64) -> TrackingStats {
        for det in detections {
            self.counts.increment(det.class);
        }

        if self.timeline.len() == self.timeline_cap {
            self.timeline.pop_front();
        }
        self.timeline.push_back(detections.len() as u32);

        let centroids: Vec<(f32, f32)> = detections.iter().map(|d| d.bbox.centroid()).collect();
        let avg_speed_kmh = self.average_speed(&centroids, interval_secs);
        self.prev_centroids = centroids;

        TrackingStats {
            active_tracks: detections.len(),
            avg_speed_kmh,
            ..Default::default()
        }
    }

    /// 最近邻质心位移 → 平均速度（km/h）
    fn average_speed(&self, centroids: &[(f32, f32)], interval_secs: f64) -> f64 {
        if centroids.is_empty() || self.prev_centroids.is_empty() || interval_secs <= 0.0 {
            return 0.0;
        }

        let mut sum = 0.0;
        for &(cx, cy) in centroids {
            let dist_px = self
                .prev_centroids
                .iter()
                .map(|&(px, py)| {
                    let (dx, dy) = ((cx - px) as f64, (cy - py) as f64);
                    (dx * dx + dy * dy).sqrt()
                })
                .fold(f64::INFINITY, f64::min);
            let speed = dist_px / self.pixels_per_meter / interval_secs * 3.6;
            sum += speed.clamp(0.0, MAX_SPEED_KMH);
        }
        sum / centroids.len() as f64
    }

    pub fn counts(&self) -> &CounterSet {
        &self.counts
    }

    /// 时间线当前内容（旧→新）
    pub fn timeline(&self) -> Vec<u32> {
        self.timeline.iter().copied().collect()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn total_detected(&self) -> u64 {
        self.counts.total()
    }

    /// 计数快照（持久化用）
    pub fn snapshot(&self) -> CounterSet {
        self.counts.clone()
    }

    /// 从持久化计数恢复（时间线与帧计数不恢复）
    pub fn restore(&mut self, counts: CounterSet) {
        self.counts = counts;
    }

    /// 清零（无恢复数据的新源启动时调用）
    pub fn reset(&mut self) {
        self.counts = CounterSet::default();
        self.timeline.clear();
        self.frame_count = 0;
        self.prev_centroids.clear();
    }
}

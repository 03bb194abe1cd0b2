use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 车辆类别
///
/// 仅保留四类车辆，其余COCO类别在检测阶段被过滤掉。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Car,
    Motorcycle,
    Bus,
    Truck,
}

impl VehicleClass {
    /// 所有类别（固定顺序）
    pub const ALL: [VehicleClass; 4] = [
        VehicleClass::Car,
        VehicleClass::Motorcycle,
        VehicleClass::Bus,
        VehicleClass::Truck,
    ];

    /// 从COCO类别ID映射（2=car, 3=motorcycle, 5=bus, 7=truck）
    pub fn from_coco_id(id: u32) -> Option<Self> {
        match id {
            2 => Some(VehicleClass::Car),
            3 => Some(VehicleClass::Motorcycle),
            5 => Some(VehicleClass::Bus),
            7 => Some(VehicleClass::Truck),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleClass::Car => "car",
            VehicleClass::Motorcycle => "motorcycle",
            VehicleClass::Bus => "bus",
            VehicleClass::Truck => "truck",
        }
    }
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 边界框（像素坐标，左上/右下）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// 中心点
    pub fn centroid(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

/// 单个检测结果（已通过车辆类别过滤）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: VehicleClass,
    /// 置信度（0.0 - 1.0）
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// 按类别的累计计数
///
/// 流传输期间单调不减，仅在无恢复数据的新源启动时清零，
/// 或在恢复会话时从持久化存储重新加载。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSet {
    pub car: u64,
    pub motorcycle: u64,
    pub bus: u64,
    pub truck: u64,
}

impl CounterSet {
    /// 指定类别加一
    pub fn increment(&mut self, class: VehicleClass) {
        match class {
            VehicleClass::Car => self.car += 1,
            VehicleClass::Motorcycle => self.motorcycle += 1,
            VehicleClass::Bus => self.bus += 1,
            VehicleClass::Truck => self.truck += 1,
        }
    }

    pub fn get(&self, class: VehicleClass) -> u64 {
        match class {
            VehicleClass::Car => self.car,
            VehicleClass::Motorcycle => self.motorcycle,
            VehicleClass::Bus => self.bus,
            VehicleClass::Truck => self.truck,
        }
    }

    /// 总检测数
    pub fn total(&self) -> u64 {
        VehicleClass::ALL.into_iter().map(|c| self.get(c)).sum()
    }
}

/// 瞬时跟踪统计
///
/// 不做跨帧身份关联：active_tracks为当前帧检测数，
/// avg_speed_kmh由相邻两个周期的最近邻质心位移推算。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingStats {
    pub active_tracks: usize,
    pub avg_speed_kmh: f64,
    /// 各方向计数（预留，当前实现不填充）
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub direction_distribution: BTreeMap<String, u32>,
}

/// 性能指标
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerfStats {
    /// 实际处理帧率
    pub fps: f64,
    /// 最近一次推理耗时（毫秒）
    pub infer_ms: f64,
}

/// 数据源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Rtsp,
    Device,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::File => f.write_str("file"),
            SourceKind::Rtsp => f.write_str("rtsp"),
            SourceKind::Device => f.write_str("device"),
        }
    }
}

/// 数据源描述
///
/// `camera_id`为稳定标识，携带时启动会尝试从计数存储恢复累计计数。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    /// 定位串：文件路径、rtsp:// URL或设备索引
    pub locator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_name: Option<String>,
}

/// 推理精度档位（对应不同规模的模型）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl fmt::Display for PrecisionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrecisionLevel::Low => f.write_str("low"),
            PrecisionLevel::Medium => f.write_str("medium"),
            PrecisionLevel::High => f.write_str("high"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coco_id_mapping() {
        assert_eq!(VehicleClass::from_coco_id(2), Some(VehicleClass::Car));
        assert_eq!(VehicleClass::from_coco_id(3), Some(VehicleClass::Motorcycle));
        assert_eq!(VehicleClass::from_coco_id(5), Some(VehicleClass::Bus));
        assert_eq!(VehicleClass::from_coco_id(7), Some(VehicleClass::Truck));
        // 行人、自行车等其他类别被拒绝
        assert_eq!(VehicleClass::from_coco_id(0), None);
        assert_eq!(VehicleClass::from_coco_id(1), None);
    }

    #[test]
    fn test_counter_set_increment() {
        let mut counts = CounterSet::default();
        counts.increment(VehicleClass::Car);
        counts.increment(VehicleClass::Car);
        counts.increment(VehicleClass::Truck);

        assert_eq!(counts.car, 2);
        assert_eq!(counts.truck, 1);
        assert_eq!(counts.motorcycle, 0);
        assert_eq!(counts.total(), 3);

        // get与字段一一对应
        assert_eq!(counts.get(VehicleClass::Car), 2);
        assert_eq!(counts.get(VehicleClass::Truck), 1);
        assert_eq!(counts.get(VehicleClass::Bus), 0);
    }

    #[test]
    fn test_bbox_centroid() {
        let bbox = BoundingBox::new(10.0, 20.0, 30.0, 60.0);
        assert_eq!(bbox.centroid(), (20.0, 40.0));
    }

    #[test]
    fn test_vehicle_class_serde() {
        let json = serde_json::to_string(&VehicleClass::Motorcycle).unwrap();
        assert_eq!(json, "\"motorcycle\"");

        let parsed: VehicleClass = serde_json::from_str("\"bus\"").unwrap();
        assert_eq!(parsed, VehicleClass::Bus);
    }
}

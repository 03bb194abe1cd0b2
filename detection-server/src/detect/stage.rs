use crate::source::Frame;
use common::{BoundingBox, Detection, PrecisionLevel, VehicleClass};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// 推理错误（视为瞬态：该周期跳过标注、计数不变）
#[derive(Debug, Clone, Error)]
pub enum InferError {
    #[error("Inference backend error: {0}")]
    Backend(String),

    #[error("Frame not decodable by backend")]
    BadFrame,
}

/// 模型原始输出（COCO类别ID，未过滤）
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub class_id: u32,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// 目标检测模型接口（外部协作方）
///
/// 每次调用同步、无副作用。置信度阈值与精度档位逐次传入，
/// 参数变更在下一次调用生效，不会打断进行中的推理。
pub trait Detector: Send + Sync {
    fn infer(
        &self,
        image: &[u8],
        confidence: f32,
        precision: PrecisionLevel,
    ) -> Result<Vec<RawDetection>, InferError>;
}

/// 空实现：未接入模型后端时使用，始终返回零检测
pub struct NullDetector;

impl Detector for NullDetector {
    fn infer(
        &self,
        _image: &[u8],
        _confidence: f32,
        _precision: PrecisionLevel,
    ) -> Result<Vec<RawDetection>, InferError> {
        Ok(Vec::new())
    }
}

/// 检测阶段
///
/// 包装外部模型调用并应用固定的车辆类别白名单：
/// 只有car/motorcycle/bus/truck四类通过，其余类别在离开本阶段前丢弃。
#[derive(Clone)]
pub struct DetectionStage {
    detector: Arc<dyn Detector>,
}

impl DetectionStage {
    pub fn new(detector: Arc<dyn Detector>) -> Self {
        Self { detector }
    }

    /// 对一帧执行推理与过滤
    ///
    /// 跳帧策略由调用方（PipelineSupervisor）实现，
    /// 本阶段收到的每一帧都必须处理。
    pub fn infer(
        &self,
        frame: &Frame,
        confidence: f32,
        precision: PrecisionLevel,
    ) -> Result<Vec<Detection>, InferError> {
        let raw = self.detector.infer(&frame.data, confidence, precision)?;
        let total = raw.len();

        let detections: Vec<Detection> = raw
            .into_iter()
            .filter_map(|r| {
                VehicleClass::from_coco_id(r.class_id).map(|class| Detection {
                    class,
                    confidence: r.confidence,
                    bbox: r.bbox,
                })
            })
            .collect();

        if detections.len() < total {
            debug!(
                "Filtered {} non-vehicle detections from frame {}",
                total - detections.len(),
                frame.seq
            );
        }
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct FixedDetector(Vec<RawDetection>);

    impl Detector for FixedDetector {
        fn infer(
            &self,
            _image: &[u8],
            _confidence: f32,
            _precision: PrecisionLevel,
        ) -> Result<Vec<RawDetection>, InferError> {
            Ok(self.0.clone())
        }
    }

    fn raw(class_id: u32, confidence: f32) -> RawDetection {
        RawDetection {
            class_id,
            confidence,
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
        }
    }

    #[test]
    fn test_vehicle_allow_list() {
        let stage = DetectionStage::new(Arc::new(FixedDetector(vec![
            raw(0, 0.9),  // person — 丢弃
            raw(1, 0.8),  // bicycle — 丢弃
            raw(2, 0.7),  // car
            raw(3, 0.6),  // motorcycle
            raw(5, 0.5),  // bus
            raw(7, 0.4),  // truck
            raw(16, 0.9), // dog — 丢弃
        ])));

        let frame = Frame::new(1, Bytes::from_static(b"jpeg"));
        let detections = stage
            .infer(&frame, 0.3, PrecisionLevel::Low)
            .unwrap();

        let classes: Vec<VehicleClass> = detections.iter().map(|d| d.class).collect();
        assert_eq!(
            classes,
            vec![
                VehicleClass::Car,
                VehicleClass::Motorcycle,
                VehicleClass::Bus,
                VehicleClass::Truck
            ]
        );
    }

    #[test]
    fn test_null_detector_is_empty() {
        let stage = DetectionStage::new(Arc::new(NullDetector));
        let frame = Frame::new(1, Bytes::from_static(b"jpeg"));
        assert!(stage
            .infer(&frame, 0.3, PrecisionLevel::High)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_backend_error_propagates() {
        struct Failing;
        impl Detector for Failing {
            fn infer(
                &self,
                _: &[u8],
                _: f32,
                _: PrecisionLevel,
            ) -> Result<Vec<RawDetection>, InferError> {
                Err(InferError::Backend("model unavailable".into()))
            }
        }
        let stage = DetectionStage::new(Arc::new(Failing));
        let frame = Frame::new(1, Bytes::from_static(b"jpeg"));
        assert!(stage.infer(&frame, 0.3, PrecisionLevel::Low).is_err());
    }
}

// 检测阶段
//
// 模型本体是外部协作方（黑盒），本模块只做编排：
// 调用`Detector`、应用车辆类别白名单、映射为领域类型。

pub mod stage;

pub use stage::{DetectionStage, Detector, InferError, NullDetector, RawDetection};

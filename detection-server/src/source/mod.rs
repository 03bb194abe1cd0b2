// 帧数据源模块
//
// 统一的帧生产者抽象，支持三种数据源：
//
// - `FileSource`: 本地MJPEG文件
// - `RtspSource`: RTSP网络流（TCP优先，UDP回退）
// - `DeviceSource`: 本地采集设备（Linux v4l2）
//
// 读取错误在本层只上报、不重试，重试预算由PipelineSupervisor掌握。

pub mod device;
pub mod file;
pub mod reader;
pub mod rtsp;

pub use device::{scan_devices, DeviceInfo, DeviceSource};
pub use file::FileSource;
pub use reader::{Frame, FrameSource, SourceError, SourceInfo};
pub use rtsp::RtspSource;

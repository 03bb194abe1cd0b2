// 本地采集设备源（Linux v4l2）
//
// 采集在专用线程内进行（v4l流句柄借用设备，不跨await持有），
// 通过容量为1的通道送出最新帧：消费慢时直接丢旧帧，
// 与RTSP端"最小缓冲"的零积压策略一致。

use super::reader::{Frame, FrameSource, SourceError, SourceInfo};
use async_trait::async_trait;
use common::SourceKind;
use serde::Serialize;

/// 扫描到的采集设备
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tracing::{debug, warn};
    use v4l::buffer::Type;
    use v4l::io::mmap::Stream;
    use v4l::io::traits::CaptureStream;
    use v4l::video::Capture;
    use v4l::{Device, FourCC};

    const MAX_SCAN: usize = 5;

    /// 采集线程向异步侧传递的事件
    enum CaptureEvent {
        Frame(Bytes),
        Error(String),
    }

    pub struct DeviceSource {
        index: usize,
        rx: mpsc::Receiver<CaptureEvent>,
        stop: Arc<AtomicBool>,
        thread: Option<std::thread::JoinHandle<()>>,
        next_seq: u64,
    }

    impl DeviceSource {
        pub async fn open(index: usize) -> Result<Self, SourceError> {
            // 打开与格式协商在阻塞线程中完成
            let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
            let (tx, rx) = mpsc::channel::<CaptureEvent>(1);
            let stop = Arc::new(AtomicBool::new(false));
            let stop_flag = stop.clone();

            let thread = std::thread::Builder::new()
                .name(format!("v4l-capture-{index}"))
                .spawn(move || capture_loop(index, ready_tx, tx, stop_flag))
                .map_err(|e| SourceError::Io(e.to_string()))?;

            match ready_rx.await {
                Ok(Ok(())) => Ok(Self {
                    index,
                    rx,
                    stop,
                    thread: Some(thread),
                    next_seq: 1,
                }),
                Ok(Err(e)) => {
                    let _ = thread.join();
                    Err(e)
                }
                Err(_) => Err(SourceError::Unreachable(format!(
                    "capture thread died opening device {index}"
                ))),
            }
        }
    }

    /// 采集循环：持有设备与mmap流，满通道时丢弃旧帧
    fn capture_loop(
        index: usize,
        ready: tokio::sync::oneshot::Sender<Result<(), SourceError>>,
        tx: mpsc::Sender<CaptureEvent>,
        stop: Arc<AtomicBool>,
    ) {
        let dev = match Device::new(index) {
            Ok(d) => d,
            Err(e) => {
                let _ = ready.send(Err(SourceError::NotFound(format!("device {index}: {e}"))));
                return;
            }
        };

        // 请求MJPG输出，帧数据即为JPEG
        let result = dev.format().and_then(|mut fmt| {
            fmt.fourcc = FourCC::new(b"MJPG");
            dev.set_format(&fmt)
        });
        if let Err(e) = result {
            let _ = ready.send(Err(SourceError::Unsupported(format!(
                "device {index} has no MJPG format: {e}"
            ))));
            return;
        }

        let mut stream = match Stream::with_buffers(&dev, Type::VideoCapture, 2) {
            Ok(s) => s,
            Err(e) => {
                let _ = ready.send(Err(SourceError::Io(format!(
                    "device {index} stream: {e}"
                ))));
                return;
            }
        };
        let _ = ready.send(Ok(()));
        debug!("Capture thread started for device {index}");

        while !stop.load(Ordering::Relaxed) {
            match stream.next() {
                Ok((buf, meta)) => {
                    let data = Bytes::copy_from_slice(&buf[..meta.bytesused as usize]);
                    // 容量1：消费端落后时丢弃本帧而不是排队
                    let _ = tx.try_send(CaptureEvent::Frame(data));
                }
                Err(e) => {
                    warn!("Capture error on device {index}: {e}");
                    let _ = tx.try_send(CaptureEvent::Error(e.to_string()));
                }
            }
        }
        debug!("Capture thread stopped for device {index}");
    }

    #[async_trait]
    impl FrameSource for DeviceSource {
        async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
            match self.rx.recv().await {
                Some(CaptureEvent::Frame(data)) => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    Ok(Some(Frame::new(seq, data)))
                }
                Some(CaptureEvent::Error(msg)) => Err(SourceError::Read(msg)),
                // 采集线程已退出
                None => Ok(None),
            }
        }

        fn info(&self) -> SourceInfo {
            SourceInfo {
                kind: SourceKind::Device,
                locator: self.index.to_string(),
                transport: None,
                fps: None,
                total_frames: None,
            }
        }

        async fn close(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            self.rx.close();
            if let Some(thread) = self.thread.take() {
                let _ = tokio::task::spawn_blocking(move || thread.join()).await;
            }
        }
    }

    impl Drop for DeviceSource {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
        }
    }

    /// 枚举可用采集设备
    pub fn scan_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();
        for index in 0..MAX_SCAN {
            let Ok(dev) = Device::new(index) else {
                continue;
            };
            let name = dev
                .query_caps()
                .map(|caps| caps.card)
                .unwrap_or_else(|_| format!("Camera {index}"));
            devices.push(DeviceInfo { index, name });
        }
        devices
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    /// 非Linux平台不支持设备采集
    pub struct DeviceSource;

    impl DeviceSource {
        pub async fn open(index: usize) -> Result<Self, SourceError> {
            Err(SourceError::Unsupported(format!(
                "device capture requires linux (device {index})"
            )))
        }
    }

    #[async_trait]
    impl FrameSource for DeviceSource {
        async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
            Ok(None)
        }

        fn info(&self) -> SourceInfo {
            SourceInfo {
                kind: SourceKind::Device,
                locator: String::new(),
                transport: None,
                fps: None,
                total_frames: None,
            }
        }

        async fn close(&mut self) {}
    }

    pub fn scan_devices() -> Vec<DeviceInfo> {
        Vec::new()
    }
}

pub use imp::{scan_devices, DeviceSource};

use super::reader::{Frame, FrameSource, SourceError, SourceInfo};
use async_trait::async_trait;
use bytes::Bytes;
use common::SourceKind;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use tracing::debug;

/// JPEG帧起始标记（SOI）
const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG帧结束标记（EOI）
const EOI: [u8; 2] = [0xFF, 0xD9];

const READ_CHUNK: usize = 64 * 1024;

/// 本地MJPEG文件源
///
/// 按SOI/EOI标记切分帧。打开时做一次整文件扫描估算总帧数，
/// 供进度展示使用；MJPEG无内嵌时间信息，帧率取配置假定值。
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    buf: Vec<u8>,
    next_seq: u64,
    total_frames: u64,
    fps: f64,
}

impl FileSource {
    /// 打开文件源
    pub async fn open(path: impl AsRef<Path>, fps: f64) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();

        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| SourceError::NotFound(path.display().to_string()))?;
        if !meta.is_file() {
            return Err(SourceError::InvalidLocator(format!(
                "not a regular file: {}",
                path.display()
            )));
        }

        let total_frames = count_frames(&path).await?;
        if total_frames == 0 {
            return Err(SourceError::InvalidLocator(format!(
                "no JPEG frames found in {}",
                path.display()
            )));
        }

        debug!(
            "Opened file source: {} ({} frames, {} bytes)",
            path.display(),
            total_frames,
            meta.len()
        );

        let file = File::open(&path).await?;
        Ok(Self {
            path,
            reader: Some(BufReader::new(file)),
            buf: Vec::with_capacity(READ_CHUNK * 2),
            next_seq: 1,
            total_frames,
            fps,
        })
    }

    /// 从缓冲中切出一个完整JPEG帧
    fn extract_frame(&mut self) -> Option<Bytes> {
        let start = find_marker(&self.buf, 0, SOI)?;
        let end = find_marker(&self.buf, start + 2, EOI)?;
        let frame = Bytes::copy_from_slice(&self.buf[start..end + 2]);
        self.buf.drain(..end + 2);
        Some(frame)
    }
}

#[async_trait]
impl FrameSource for FileSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        loop {
            if let Some(data) = self.extract_frame() {
                let seq = self.next_seq;
                self.next_seq += 1;
                return Ok(Some(Frame::new(seq, data)));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = match self.reader.as_mut() {
                Some(r) => r.read(&mut chunk).await?,
                None => return Ok(None),
            };
            if n == 0 {
                // 文件读尽，残留字节不足一帧则视为流结束
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn info(&self) -> SourceInfo {
        SourceInfo {
            kind: SourceKind::File,
            locator: self.path.display().to_string(),
            transport: None,
            fps: Some(self.fps),
            total_frames: Some(self.total_frames),
        }
    }

    async fn close(&mut self) {
        self.reader = None;
        self.buf.clear();
    }
}

/// 在buf中从start起查找双字节标记
fn find_marker(buf: &[u8], start: usize, marker: [u8; 2]) -> Option<usize> {
    if buf.len() < 2 || start >= buf.len() - 1 {
        return None;
    }
    buf[start..]
        .windows(2)
        .position(|w| w == marker)
        .map(|p| start + p)
}

/// 整文件扫描统计SOI标记数
async fn count_frames(path: &Path) -> Result<u64, SourceError> {
    let mut file = File::open(path).await?;
    let mut count = 0u64;
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut prev: Option<u8> = None;

    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        // 跨块边界的标记
        if prev == Some(0xFF) && chunk[0] == 0xD8 {
            count += 1;
        }
        count += chunk[..n].windows(2).filter(|w| *w == SOI).count() as u64;
        prev = Some(chunk[n - 1]);
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fake_jpeg(payload: &[u8]) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&SOI);
        v.extend_from_slice(payload);
        v.extend_from_slice(&EOI);
        v
    }

    fn write_mjpeg(frames: &[Vec<u8>]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for frame in frames {
            f.write_all(frame).unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[tokio::test]
    async fn test_reads_frames_in_order() {
        let frames = vec![
            fake_jpeg(b"one"),
            fake_jpeg(b"two"),
            fake_jpeg(b"three"),
        ];
        let file = write_mjpeg(&frames);

        let mut source = FileSource::open(file.path(), 25.0).await.unwrap();
        assert_eq!(source.info().total_frames, Some(3));

        for (i, expected) in frames.iter().enumerate() {
            let frame = source.next_frame().await.unwrap().unwrap();
            assert_eq!(frame.seq, (i + 1) as u64);
            assert_eq!(&frame.data[..], &expected[..]);
        }

        // 流结束
        assert!(source.next_frame().await.unwrap().is_none());
        // 结束后继续读取仍为None
        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let err = FileSource::open("/nonexistent/video.mjpeg", 25.0)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_empty_file_rejected() {
        let file = write_mjpeg(&[b"garbage without markers".to_vec()]);
        let err = FileSource::open(file.path(), 25.0).await.unwrap_err();
        assert!(matches!(err, SourceError::InvalidLocator(_)));
    }

    #[test]
    fn test_find_marker() {
        let buf = [0x00, 0xFF, 0xD8, 0x01, 0xFF, 0xD9];
        assert_eq!(find_marker(&buf, 0, SOI), Some(1));
        assert_eq!(find_marker(&buf, 2, EOI), Some(4));
        assert_eq!(find_marker(&buf, 5, EOI), None);
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow};
use image::RgbImage;
use log::{debug, warn};
use walkdir::WalkDir;

use crate::geometry::Size;

/// 一帧相机画面
///
/// 由帧源产生，只被处理一次，然后丢弃。
#[derive(Debug, Clone)]
pub struct Frame {
    /// RGB 像素数据
    pub image: RgbImage,
    /// 相对于帧源启动时刻的时间戳
    pub timestamp: Duration,
}

impl Frame {
    pub fn new(image: RgbImage, timestamp: Duration) -> Self {
        Self { image, timestamp }
    }

    pub fn size(&self) -> Size {
        Size::new(self.image.width() as f64, self.image.height() as f64)
    }
}

/// 帧源，例如相机或录制好的图片序列
pub trait FrameSource: Send {
    /// 请求采集权限，返回是否获得授权
    fn request_access(&mut self) -> bool {
        true
    }

    /// 打开并配置设备，失败时不会开始采集
    fn start(&mut self) -> Result<()>;

    /// 阻塞等待下一帧，返回 `None` 表示帧源已结束
    fn next_frame(&mut self) -> Option<Frame>;
}

/// 按路径顺序回放目录中的图片，每张图片作为一帧
pub struct DirectorySource {
    dir: PathBuf,
    frame_interval: Duration,
    files: Vec<PathBuf>,
    index: usize,
}

impl DirectorySource {
    /// # Arguments
    ///
    /// * `dir` - 图片目录
    /// * `frame_interval` - 相邻两帧之间的时间戳间隔
    pub fn new(dir: impl AsRef<Path>, frame_interval: Duration) -> Self {
        Self { dir: dir.as_ref().to_path_buf(), frame_interval, files: vec![], index: 0 }
    }
}

impl FrameSource for DirectorySource {
    fn start(&mut self) -> Result<()> {
        if !self.dir.is_dir() {
            return Err(anyhow!("帧目录不存在: {}", self.dir.display()));
        }
        let mut files = WalkDir::new(&self.dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| image::ImageFormat::from_path(path).is_ok())
            .collect::<Vec<_>>();
        files.sort();
        debug!("帧目录 {} 中共 {} 张图片", self.dir.display(), files.len());
        self.files = files;
        self.index = 0;
        Ok(())
    }

    fn next_frame(&mut self) -> Option<Frame> {
        while self.index < self.files.len() {
            let path = &self.files[self.index];
            let timestamp = self.frame_interval * self.index as u32;
            self.index += 1;
            match image::open(path) {
                Ok(img) => return Some(Frame::new(img.to_rgb8(), timestamp)),
                Err(e) => warn!("读取帧失败 {}: {}", path.display(), e),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_source_replays_sorted_frames() {
        let dir = tempfile::TempDir::new().unwrap();
        for (name, w) in [("b.png", 3), ("a.png", 2), ("c.txt", 0)] {
            if w == 0 {
                std::fs::write(dir.path().join(name), "not an image").unwrap();
            } else {
                RgbImage::new(w, 1).save(dir.path().join(name)).unwrap();
            }
        }

        let mut source = DirectorySource::new(dir.path(), Duration::from_millis(100));
        source.start().unwrap();

        let first = source.next_frame().unwrap();
        assert_eq!(first.image.width(), 2);
        assert_eq!(first.timestamp, Duration::ZERO);
        let second = source.next_frame().unwrap();
        assert_eq!(second.image.width(), 3);
        assert_eq!(second.timestamp, Duration::from_millis(100));
        assert!(source.next_frame().is_none());
    }

    #[test]
    fn missing_directory_fails_to_start() {
        let mut source = DirectorySource::new("/nonexistent/frames", Duration::from_millis(100));
        assert!(source.start().is_err());
    }
}

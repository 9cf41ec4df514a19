use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::{HighlightError, HighlightResult};
use crate::scene_detector::SceneWindow;
use crate::video_processor::MediaTool;

/// 代表帧的简单统计信息，作为评分提示发送给 oracle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameStats {
    pub width: u32,
    pub height: u32,
    /// 平均亮度（0-255）
    pub brightness: f64,
}

impl FrameStats {
    pub fn from_image(img: &DynamicImage) -> Self {
        let gray = img.to_luma8();
        let total_pixels = (gray.width() as u64 * gray.height() as u64).max(1);
        let sum: u64 = gray.pixels().map(|p| p[0] as u64).sum();

        Self {
            width: gray.width(),
            height: gray.height(),
            brightness: sum as f64 / total_pixels as f64,
        }
    }

    /// 给 oracle 的文字描述
    pub fn describe(&self) -> String {
        format!(
            "Frame resolution: {}x{}\nAverage brightness: {:.1}/255",
            self.width, self.height, self.brightness
        )
    }
}

/// 一个场景抽出的代表帧
#[derive(Debug, Clone)]
pub struct SampledFrame {
    pub path: PathBuf,
    /// 抽帧位置（秒）
    pub offset: f64,
    pub stats: FrameStats,
}

/// 帧采样器：在每个场景中点抽取一张静帧
pub struct FrameSampler {
    media: Arc<dyn MediaTool>,
    frames_dir: PathBuf,
}

impl FrameSampler {
    pub fn new(media: Arc<dyn MediaTool>, frames_dir: impl Into<PathBuf>) -> Self {
        Self {
            media,
            frames_dir: frames_dir.into(),
        }
    }

    /// 帧文件路径：`<frames_dir>/scene_{index:03}.jpg`
    pub fn frame_path(&self, window: &SceneWindow) -> PathBuf {
        self.frames_dir.join(format!("scene_{:03}.jpg", window.index()))
    }

    /// 在场景中点抽帧并校验图片可解码
    ///
    /// 任何失败都以 `FrameExtractionFailed` 返回，由调用方记录后跳过该场景。
    pub async fn sample(&self, video: &Path, window: &SceneWindow) -> HighlightResult<SampledFrame> {
        let offset = window.midpoint();
        let path = self.frame_path(window);
        let failed = |message: String| HighlightError::FrameExtractionFailed {
            scene_index: window.index(),
            message,
        };

        self.media
            .extract_frame(video, offset, &path)
            .await
            .map_err(|e| failed(e.to_string()))?;

        let decode_path = path.clone();
        let stats = tokio::task::spawn_blocking(move || {
            image::open(&decode_path).map(|img| FrameStats::from_image(&img))
        })
        .await
        .map_err(|e| failed(format!("解码任务异常: {}", e)))?
        .map_err(|e| failed(format!("帧图片无法解码: {}", e)))?;

        debug!(
            "📸 [抽帧] 场景 {} @ {:.2}s -> {} ({}x{})",
            window.index(),
            offset,
            path.display(),
            stats.width,
            stats.height
        );

        Ok(SampledFrame { path, offset, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video_processor::{CutDetection, ExportMode, VideoInfo};
    use async_trait::async_trait;
    use image::ImageBuffer;
    use std::sync::Mutex;

    /// 把一张纯色图片写到请求的位置，并记录抽帧位置
    struct StillWriter {
        offsets: Mutex<Vec<f64>>,
        write_garbage: bool,
    }

    #[async_trait]
    impl MediaTool for StillWriter {
        async fn probe(&self, _video: &Path) -> HighlightResult<VideoInfo> {
            unreachable!()
        }

        async fn list_cut_points(&self, _video: &Path, _d: CutDetection) -> HighlightResult<Vec<f64>> {
            unreachable!()
        }

        async fn extract_frame(&self, _video: &Path, offset: f64, output: &Path) -> HighlightResult<()> {
            self.offsets.lock().unwrap().push(offset);
            std::fs::create_dir_all(output.parent().unwrap())?;
            if self.write_garbage {
                std::fs::write(output, b"not an image")?;
            } else {
                let img = DynamicImage::ImageLuma8(ImageBuffer::from_fn(8, 4, |_, _| image::Luma([100u8])));
                img.save_with_format(output, image::ImageFormat::Jpeg).unwrap();
            }
            Ok(())
        }

        async fn extract_clip(
            &self,
            _video: &Path,
            _start: f64,
            _duration: f64,
            _output: &Path,
            _mode: ExportMode,
        ) -> HighlightResult<()> {
            unreachable!()
        }
    }

    #[test]
    fn test_frame_stats() {
        let img = DynamicImage::ImageLuma8(ImageBuffer::from_fn(10, 10, |x, _| {
            image::Luma([if x < 5 { 0u8 } else { 200u8 }])
        }));
        let stats = FrameStats::from_image(&img);
        assert_eq!((stats.width, stats.height), (10, 10));
        assert!((stats.brightness - 100.0).abs() < 1e-9);
        assert!(stats.describe().contains("10x10"));
    }

    #[tokio::test]
    async fn test_samples_at_midpoint() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(StillWriter { offsets: Mutex::new(Vec::new()), write_garbage: false });
        let sampler = FrameSampler::new(tool.clone(), dir.path().join("frames"));
        let window = SceneWindow::new(7, 10.0, 25.0).unwrap();

        let frame = sampler.sample(Path::new("apex_match.mp4"), &window).await.unwrap();

        assert_eq!(frame.offset, 17.5);
        assert_eq!(*tool.offsets.lock().unwrap(), vec![17.5]);
        assert!(frame.path.ends_with("frames/scene_007.jpg"));
        assert_eq!((frame.stats.width, frame.stats.height), (8, 4));
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_extraction_failure() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(StillWriter { offsets: Mutex::new(Vec::new()), write_garbage: true });
        let sampler = FrameSampler::new(tool, dir.path());
        let window = SceneWindow::new(3, 0.0, 4.0).unwrap();

        let err = sampler.sample(Path::new("apex_match.mp4"), &window).await.unwrap_err();
        assert!(matches!(err, HighlightError::FrameExtractionFailed { scene_index: 3, .. }));
    }
}

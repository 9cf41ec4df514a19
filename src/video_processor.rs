use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{HighlightError, HighlightResult};
use crate::retry::{retry_async, RetryConfig};

/// 视频基本信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    /// 视频总时长（秒）
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    /// 视频编码
    pub codec: String,
}

impl VideoInfo {
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// 切点来源
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum CutDetection {
    /// 使用关键帧（ffprobe 的 K 标记）作为切点
    Keyframes,
    /// 使用 ffmpeg 场景变化检测，threshold 为 0.0-1.0
    Scene { threshold: f64 },
}

/// 片段导出方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    /// 直接复制码流，不重新编码
    StreamCopy,
    /// 重新编码为 H.264/AAC
    Reencode,
}

/// 外部媒体工具的能力边界
///
/// 流水线只通过这个 trait 访问视频，测试中可以用内存实现替换 ffmpeg。
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// 获取视频时长、分辨率和编码
    async fn probe(&self, video: &Path) -> HighlightResult<VideoInfo>;

    /// 列出候选切点（秒），按工具报告的原始顺序返回
    async fn list_cut_points(&self, video: &Path, detection: CutDetection) -> HighlightResult<Vec<f64>>;

    /// 在 offset 处抽取一张静帧
    async fn extract_frame(&self, video: &Path, offset: f64, output: &Path) -> HighlightResult<()>;

    /// 抽取 [start, start + duration] 的子片段
    async fn extract_clip(
        &self,
        video: &Path,
        start: f64,
        duration: f64,
        output: &Path,
        mode: ExportMode,
    ) -> HighlightResult<()>;
}

/// 切点检测的输出：原始切点与视频总时长
#[derive(Debug, Clone, PartialEq)]
pub struct CutTimestamps {
    /// 切点序列，保证以 0.0 开头、以总时长结尾
    pub timestamps: Vec<f64>,
    pub total_duration: f64,
    /// 工具实际报告的切点数量（不含隐式边界）
    pub reported: usize,
}

impl CutTimestamps {
    /// 在工具报告的切点两端补上隐式边界，不排序、不去重
    pub fn from_reported(reported: Vec<f64>, total_duration: f64) -> Self {
        let count = reported.len();
        let mut timestamps = Vec::with_capacity(count + 2);
        if reported.first().map_or(true, |t| *t != 0.0) {
            timestamps.push(0.0);
        }
        timestamps.extend(reported);
        if timestamps.last().map_or(true, |t| *t != total_duration) {
            timestamps.push(total_duration);
        }

        Self {
            timestamps,
            total_duration,
            reported: count,
        }
    }
}

/// 获取视频的切点与总时长
///
/// 视频不存在或工具无法打开时返回 `MediaUnavailable`；没有切点不是错误，整段视频会成为一个窗口。
pub async fn get_cut_timestamps(
    tool: &dyn MediaTool,
    video: &Path,
    detection: CutDetection,
) -> HighlightResult<(VideoInfo, CutTimestamps)> {
    if !video.exists() {
        return Err(HighlightError::media_unavailable(video, "文件不存在"));
    }

    let info = tool
        .probe(video)
        .await
        .map_err(|e| HighlightError::media_unavailable(video, e.to_string()))?;
    if !info.duration.is_finite() || info.duration <= 0.0 {
        return Err(HighlightError::media_unavailable(video, "无法读取视频时长"));
    }

    let reported = tool
        .list_cut_points(video, detection)
        .await
        .map_err(|e| HighlightError::media_unavailable(video, e.to_string()))?;

    info!(
        "🔍 [切点检测] 视频时长 {:.1}s，工具报告 {} 个切点",
        info.duration,
        reported.len()
    );

    let cuts = CutTimestamps::from_reported(reported, info.duration);
    Ok((info, cuts))
}

/// 基于 ffmpeg/ffprobe 命令行的媒体工具
pub struct FfmpegTool {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    /// 单条命令超时
    timeout: Duration,
    retry: RetryConfig,
}

impl Default for FfmpegTool {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

impl FfmpegTool {
    pub fn new(timeout: Duration) -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            timeout,
            retry: RetryConfig::new("媒体命令"),
        }
    }

    /// 指定 ffmpeg/ffprobe 可执行文件路径
    pub fn with_binaries(mut self, ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        self.ffmpeg = ffmpeg.into();
        self.ffprobe = ffprobe.into();
        self
    }

    /// 执行一条命令，受超时约束，失败时重试一次
    async fn run(&self, program: &Path, args: &[String]) -> HighlightResult<Output> {
        let name = program.to_string_lossy().to_string();
        let timeout = self.timeout;

        retry_async(&self.retry, HighlightError::is_retryable, || {
            let name = name.clone();
            async move {
                debug!("▶️  [媒体命令] {} {}", name, args.join(" "));
                let mut command = Command::new(program);
                command
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true);

                let output = tokio::time::timeout(timeout, command.output())
                    .await
                    .map_err(|_| HighlightError::Timeout(timeout.as_secs()))?
                    .map_err(|e| HighlightError::command_failed(&name, format!("无法启动: {}", e)))?;

                if !output.status.success() {
                    return Err(HighlightError::command_failed(
                        &name,
                        String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    ));
                }
                Ok(output)
            }
        })
        .await
    }
}

/// ffprobe JSON 输出
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
    codec_name: Option<String>,
}

fn parse_probe_output(stdout: &[u8]) -> HighlightResult<VideoInfo> {
    let probe: FfprobeOutput = serde_json::from_slice(stdout)?;

    let duration = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_ref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let stream = probe.streams.iter().find(|s| s.width.is_some());

    Ok(VideoInfo {
        duration,
        width: stream.and_then(|s| s.width).unwrap_or(0),
        height: stream.and_then(|s| s.height).unwrap_or(0),
        codec: stream
            .and_then(|s| s.codec_name.clone())
            .unwrap_or_else(|| "unknown".to_string()),
    })
}

/// 解析 `ffprobe -show_entries packet=pts_time,flags -of csv` 的输出，只保留关键帧
///
/// 无法解析的行直接跳过。
fn parse_keyframe_csv(stdout: &str) -> Vec<f64> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.trim().split(',').collect();
            if parts.len() < 3 || !parts[2].contains('K') {
                return None;
            }
            parts[1].parse::<f64>().ok()
        })
        .collect()
}

/// 解析 showinfo 滤镜在 stderr 中输出的 pts_time
fn parse_showinfo_times(stderr: &str) -> Vec<f64> {
    stderr
        .lines()
        .filter(|line| line.contains("Parsed_showinfo"))
        .filter_map(|line| {
            let rest = &line[line.find("pts_time:")? + "pts_time:".len()..];
            let value = rest.split_whitespace().next()?;
            value.parse::<f64>().ok()
        })
        .collect()
}

fn secs(value: f64) -> String {
    format!("{:.3}", value)
}

#[async_trait]
impl MediaTool for FfmpegTool {
    async fn probe(&self, video: &Path) -> HighlightResult<VideoInfo> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-select_streams".to_string(),
            "v:0".to_string(),
            "-show_entries".to_string(),
            "format=duration:stream=width,height,codec_name".to_string(),
            "-of".to_string(),
            "json".to_string(),
            video.to_string_lossy().to_string(),
        ];
        let output = self.run(&self.ffprobe, &args).await?;
        parse_probe_output(&output.stdout)
    }

    async fn list_cut_points(&self, video: &Path, detection: CutDetection) -> HighlightResult<Vec<f64>> {
        match detection {
            CutDetection::Keyframes => {
                let args = vec![
                    "-v".to_string(),
                    "error".to_string(),
                    "-select_streams".to_string(),
                    "v:0".to_string(),
                    "-show_entries".to_string(),
                    "packet=pts_time,flags".to_string(),
                    "-of".to_string(),
                    "csv".to_string(),
                    video.to_string_lossy().to_string(),
                ];
                let output = self.run(&self.ffprobe, &args).await?;
                Ok(parse_keyframe_csv(&String::from_utf8_lossy(&output.stdout)))
            }
            CutDetection::Scene { threshold } => {
                let args = vec![
                    "-hide_banner".to_string(),
                    "-i".to_string(),
                    video.to_string_lossy().to_string(),
                    "-vf".to_string(),
                    format!("select='gt(scene,{})',showinfo", threshold),
                    "-f".to_string(),
                    "null".to_string(),
                    "-".to_string(),
                ];
                let output = self.run(&self.ffmpeg, &args).await?;
                Ok(parse_showinfo_times(&String::from_utf8_lossy(&output.stderr)))
            }
        }
    }

    async fn extract_frame(&self, video: &Path, offset: f64, output: &Path) -> HighlightResult<()> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let args = vec![
            "-loglevel".to_string(),
            "error".to_string(),
            "-ss".to_string(),
            secs(offset),
            "-i".to_string(),
            video.to_string_lossy().to_string(),
            "-vframes".to_string(),
            "1".to_string(),
            "-q:v".to_string(),
            "2".to_string(),
            "-y".to_string(),
            output.to_string_lossy().to_string(),
        ];
        self.run(&self.ffmpeg, &args).await?;

        if !output.exists() {
            return Err(HighlightError::command_failed("ffmpeg", "未生成帧文件"));
        }
        Ok(())
    }

    async fn extract_clip(
        &self,
        video: &Path,
        start: f64,
        duration: f64,
        output: &Path,
        mode: ExportMode,
    ) -> HighlightResult<()> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut args = vec![
            "-loglevel".to_string(),
            "error".to_string(),
            "-ss".to_string(),
            secs(start),
            "-i".to_string(),
            video.to_string_lossy().to_string(),
            "-t".to_string(),
            secs(duration),
        ];
        match mode {
            ExportMode::StreamCopy => {
                args.extend(["-c".to_string(), "copy".to_string()]);
            }
            ExportMode::Reencode => {
                args.extend([
                    "-c:v".to_string(),
                    "libx264".to_string(),
                    "-c:a".to_string(),
                    "aac".to_string(),
                ]);
            }
        }
        args.extend(["-y".to_string(), output.to_string_lossy().to_string()]);

        self.run(&self.ffmpeg, &args).await?;

        let size = tokio::fs::metadata(output).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            warn!("⚠️  [媒体命令] 片段文件为空: {}", output.display());
            return Err(HighlightError::command_failed("ffmpeg", "生成的片段文件为空"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_output() {
        let json = br#"{
            "streams": [{"width": 1920, "height": 1080, "codec_name": "h264"}],
            "format": {"duration": "123.456000"}
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.duration, 123.456);
        assert_eq!(info.resolution(), "1920x1080");
        assert_eq!(info.codec, "h264");
    }

    #[test]
    fn test_parse_probe_output_without_video_stream() {
        let info = parse_probe_output(br#"{"streams": [], "format": {}}"#).unwrap();
        assert_eq!(info.duration, 0.0);
        assert_eq!(info.codec, "unknown");
    }

    #[test]
    fn test_parse_keyframe_csv_keeps_only_keyframes() {
        let csv = "packet,0.000000,K__\npacket,0.033000,___\npacket,2.002000,K__\ngarbage\npacket,N/A,K__\n";
        assert_eq!(parse_keyframe_csv(csv), vec![0.0, 2.002]);
    }

    #[test]
    fn test_parse_showinfo_times() {
        let stderr = "[Parsed_showinfo_1 @ 0x55] n:   0 pts:  30030 pts_time:1.001   duration:1001\n\
                      frame=  2 fps=0.0 q=-0.0 size=N/A\n\
                      [Parsed_showinfo_1 @ 0x55] n:   1 pts: 360360 pts_time:12.012  duration:1001\n";
        assert_eq!(parse_showinfo_times(stderr), vec![1.001, 12.012]);
    }

    #[test]
    fn test_implicit_boundaries_added() {
        let cuts = CutTimestamps::from_reported(vec![10.0, 25.0], 60.0);
        assert_eq!(cuts.timestamps, vec![0.0, 10.0, 25.0, 60.0]);
        assert_eq!(cuts.reported, 2);
    }

    #[test]
    fn test_implicit_boundaries_not_duplicated() {
        let cuts = CutTimestamps::from_reported(vec![0.0, 10.0, 60.0], 60.0);
        assert_eq!(cuts.timestamps, vec![0.0, 10.0, 60.0]);
    }

    #[test]
    fn test_no_cut_points_gives_whole_video() {
        let cuts = CutTimestamps::from_reported(Vec::new(), 42.0);
        assert_eq!(cuts.timestamps, vec![0.0, 42.0]);
        assert_eq!(cuts.reported, 0);
    }

    #[test]
    fn test_reported_order_is_preserved() {
        let cuts = CutTimestamps::from_reported(vec![10.0, 5.0, 5.0], 20.0);
        assert_eq!(cuts.timestamps, vec![0.0, 10.0, 5.0, 5.0, 20.0]);
    }

    /// 能打开文件但读不出时长的工具
    struct ZeroLength;

    #[async_trait]
    impl MediaTool for ZeroLength {
        async fn probe(&self, _video: &Path) -> HighlightResult<VideoInfo> {
            Ok(VideoInfo { duration: 0.0, width: 0, height: 0, codec: "unknown".to_string() })
        }

        async fn list_cut_points(&self, _video: &Path, _d: CutDetection) -> HighlightResult<Vec<f64>> {
            Ok(Vec::new())
        }

        async fn extract_frame(&self, _video: &Path, _offset: f64, _output: &Path) -> HighlightResult<()> {
            unreachable!()
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

    #[tokio::test]
    async fn test_zero_duration_is_media_unavailable() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = get_cut_timestamps(&ZeroLength, file.path(), CutDetection::Keyframes)
            .await
            .unwrap_err();
        assert!(matches!(err, HighlightError::MediaUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_missing_video_is_media_unavailable() {
        let tool = FfmpegTool::default();
        let err = get_cut_timestamps(&tool, Path::new("/nonexistent/apex_match.mp4"), CutDetection::Keyframes)
            .await
            .unwrap_err();
        assert!(matches!(err, HighlightError::MediaUnavailable { .. }));
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::clip_exporter::ClipExporter;
use crate::error::{HighlightError, HighlightResult};
use crate::frame_sampler::FrameSampler;
use crate::metadata::{ConfigSnapshot, Diagnostic, RunMetadata, RunStatus, Stage, VideoSection};
use crate::ranking::{rank_order, select, CandidateSummary, ScoredCandidate};
use crate::retry::RetryConfig;
use crate::scene_detector::{limit_windows, SceneDetector, SceneWindow};
use crate::scorer::{score_with_retry, Scorer, ScoringContext, VideoPosition};
use crate::video_processor::{get_cut_timestamps, CutDetection, MediaTool};

/// 高光提取配置
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// 切点来源
    pub cut_detection: CutDetection,
    /// 最小场景持续时间（秒）
    pub min_duration: f64,
    /// 最大场景持续时间（秒）
    pub max_duration: f64,
    /// 导出的片段数量 K
    pub top_count: usize,
    /// 参与评分的场景上限，0 表示不限制
    pub max_scenes: usize,
    /// 低于该分数的候选不参与排序
    pub score_floor: u8,
    /// 评分目标，例如 "excitement"
    pub optimize_for: String,
    /// 可选的游戏类型提示
    pub genre: Option<String>,
    /// 没有合格场景时是否改用等长分段
    pub chunk_fallback: bool,
    /// 片段输出根目录，实际目录为 `<clips_dir>/<视频名>`
    pub clips_dir: PathBuf,
    /// 元数据根目录，实际文件为 `<metadata_dir>/<视频名>/metadata.json`
    pub metadata_dir: PathBuf,
    pub clip_extension: String,
    /// 同时进行的抽帧评分/导出任务数
    pub concurrency: usize,
    /// 评分失败比例超过该值时中止运行，1.0 表示从不中止
    pub abort_failure_ratio: f64,
    /// 至少完成这么多场景后才检查失败比例
    pub abort_min_attempts: usize,
    pub scoring_retry: RetryConfig,
    /// 评分模型名称，只记录到元数据
    pub oracle_model: String,
}

impl ProcessConfig {
    fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            cut_detection: self.cut_detection,
            min_duration: self.min_duration,
            max_duration: self.max_duration,
            top_count: self.top_count,
            max_scenes: self.max_scenes,
            score_floor: self.score_floor,
            optimize_for: self.optimize_for.clone(),
            chunk_fallback: self.chunk_fallback,
            oracle_model: self.oracle_model.clone(),
            concurrency: self.concurrency,
            abort_failure_ratio: self.abort_failure_ratio,
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            cut_detection: CutDetection::Keyframes,
            min_duration: 2.0,
            max_duration: 60.0,
            top_count: 3,
            max_scenes: 20,
            score_floor: 0,
            optimize_for: "excitement".to_string(),
            genre: None,
            chunk_fallback: false,
            clips_dir: PathBuf::from("output/clips"),
            metadata_dir: PathBuf::from("output/metadata"),
            clip_extension: "mp4".to_string(),
            concurrency: 4,
            abort_failure_ratio: 1.0,
            abort_min_attempts: 4,
            scoring_retry: RetryConfig::new("场景评分"),
            oracle_model: crate::vision_client::DEFAULT_MODEL.to_string(),
        }
    }
}

/// 处理结果
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// 片段输出目录
    pub clips_dir: PathBuf,
    /// 元数据文件路径
    pub metadata_path: PathBuf,
    pub metadata: RunMetadata,
    /// 入选场景，按排名排序
    pub selection: Vec<ScoredCandidate>,
}

/// 单个场景抽帧评分的结果
enum WindowOutcome {
    Scored(ScoredCandidate),
    FrameFailed(usize, HighlightError),
    ScoreFailed(usize, HighlightError),
}

/// 高光提取流水线
pub struct Pipeline {
    config: ProcessConfig,
    media: Arc<dyn MediaTool>,
    scorer: Arc<dyn Scorer>,
}

impl Pipeline {
    pub fn new(config: ProcessConfig, media: Arc<dyn MediaTool>, scorer: Arc<dyn Scorer>) -> Self {
        Self { config, media, scorer }
    }

    /// 执行一次完整的提取
    ///
    /// 任何终止性错误（视频不可用、没有合格场景、评分中止、全部导出失败）返回前都会先写入元数据。
    pub async fn run(&self, video: &Path, dry_run: bool) -> HighlightResult<ProcessOutput> {
        let config = &self.config;
        let total_start = Instant::now();
        let mut stages: Vec<(&str, Duration)> = Vec::new();

        info!("🎬 [高光提取] 开始处理视频: {}", video.display());
        if dry_run {
            info!("🧪 [高光提取] dry run 模式，不会导出片段文件");
        }
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        let video_base = video
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "video".to_string());
        let clips_dir = config.clips_dir.join(&video_base);
        let metadata_path = config.metadata_dir.join(&video_base).join("metadata.json");
        let mut video_section = VideoSection {
            path: video.to_string_lossy().to_string(),
            name: video_base.clone(),
            duration: 0.0,
            resolution: "unknown".to_string(),
            codec: "unknown".to_string(),
        };

        // 1. 切点检测
        let cut_start = Instant::now();
        info!("⏳ [切点检测] 正在读取视频信息和切点...");
        let (video_info, cuts) =
            match get_cut_timestamps(self.media.as_ref(), video, config.cut_detection).await {
                Ok(found) => found,
                Err(err) => {
                    error!("❌ [切点检测] {}", err);
                    let mut metadata = RunMetadata::new(video_section, config.snapshot(), dry_run);
                    return Err(fail(&mut metadata, &metadata_path, RunStatus::MediaUnavailable, total_start, err).await);
                }
            };
        let cut_duration = cut_start.elapsed();
        stages.push(("切点检测", cut_duration));
        info!("✅ [切点检测] 完成，耗时: {:.2}秒", cut_duration.as_secs_f64());
        info!("  • 分辨率: {}", video_info.resolution());
        info!("  • 切点数: {} 个", cuts.reported);

        video_section.duration = video_info.duration;
        video_section.resolution = video_info.resolution();
        video_section.codec = video_info.codec.clone();
        let mut metadata = RunMetadata::new(video_section, config.snapshot(), dry_run);
        metadata.processing.cut_points_found = cuts.reported;

        // 2. 候选构建
        let build_start = Instant::now();
        let detector = SceneDetector::new(config.min_duration, config.max_duration);
        let mut windows = detector.build_windows(&cuts.timestamps, cuts.total_duration);
        metadata.processing.valid_windows = windows.len();

        if windows.is_empty() && config.chunk_fallback {
            warn!("⚠️  [候选构建] 没有符合时长的场景，改用等长分段");
            windows = detector.fallback_chunks(cuts.total_duration);
            metadata.processing.used_chunk_fallback = true;
        }
        if windows.is_empty() {
            let err = HighlightError::NoValidScenes {
                min_duration: config.min_duration,
                max_duration: config.max_duration,
            };
            error!("❌ [候选构建] {}", err);
            return Err(fail(&mut metadata, &metadata_path, RunStatus::NoValidScenes, total_start, err).await);
        }

        let (windows, capped) = limit_windows(windows, config.max_scenes);
        metadata.processing.windows_capped = capped;
        let build_duration = build_start.elapsed();
        stages.push(("候选构建", build_duration));
        info!("✅ [候选构建] 完成，耗时: {:.2}秒", build_duration.as_secs_f64());
        info!(
            "  • 合格场景: {} 个（时长 {:.1}s - {:.1}s）",
            metadata.processing.valid_windows, config.min_duration, config.max_duration
        );
        if capped > 0 {
            info!("  • 超出上限被跳过: {} 个", capped);
        }

        // 3. 抽帧与评分
        let score_start = Instant::now();
        info!(
            "⏳ [评分] 正在抽帧并评分 {} 个场景（并发 {}）...",
            windows.len(),
            config.concurrency
        );
        let sampler = Arc::new(FrameSampler::new(Arc::clone(&self.media), clips_dir.join("frames")));
        let outcome = self
            .score_windows(video, &windows, cuts.total_duration, sampler, &mut metadata)
            .await;
        let (mut scored, aborted) = match outcome {
            Ok(scored) => (scored, None),
            Err((partial, err)) => (partial, Some(err)),
        };
        scored.sort_by(rank_order);
        metadata.candidates = scored.iter().map(CandidateSummary::from).collect();
        if let Some(err) = aborted {
            error!("❌ [评分] {}", err);
            return Err(fail(&mut metadata, &metadata_path, RunStatus::Aborted, total_start, err).await);
        }

        let score_duration = score_start.elapsed();
        stages.push(("抽帧评分", score_duration));
        let avg_score_time = if windows.is_empty() {
            0.0
        } else {
            score_duration.as_millis() as f64 / windows.len() as f64
        };
        info!("✅ [评分] 完成，耗时: {:.2}秒", score_duration.as_secs_f64());
        info!("  • 评分成功: {} 个", metadata.processing.scenes_scored);
        info!("  • 抽帧失败: {} 个", metadata.processing.frame_failures);
        info!("  • 评分失败: {} 个", metadata.processing.scoring_failures);
        info!("  • 平均每场景耗时: {:.2}ms", avg_score_time);

        // 4. 排序选取
        let selection = select(&scored, config.top_count, config.score_floor);
        metadata.processing.clips_selected = selection.len();
        info!(
            "🏆 [排序] 从 {} 个候选中选出 {} 个片段（K = {}）",
            scored.len(),
            selection.len(),
            config.top_count
        );
        for (i, candidate) in selection.iter().enumerate() {
            debug!(
                "  #{} 场景 {} [{:.1}s - {:.1}s] {} 分: {}",
                i + 1,
                candidate.window.index(),
                candidate.window.start(),
                candidate.window.end(),
                candidate.score,
                candidate.label
            );
        }

        // 5. 片段导出
        let export_start = Instant::now();
        let exporter = ClipExporter::new(
            Arc::clone(&self.media),
            &clips_dir,
            config.clip_extension.clone(),
            config.concurrency,
        );
        if dry_run {
            metadata.clips = exporter.plan(&selection);
        } else if !selection.is_empty() {
            info!("⏳ [片段导出] 正在导出 {} 个片段...", selection.len());
            let (clips, diagnostics) = exporter.export(video, &video_base, &selection).await;
            metadata.processing.clips_exported = clips.len();
            metadata.clips = clips;
            metadata.diagnostics.extend(diagnostics);

            if metadata.clips.is_empty() {
                let err = HighlightError::AllExportsFailed(selection.len());
                error!("❌ [片段导出] {}", err);
                return Err(fail(&mut metadata, &metadata_path, RunStatus::AllExportsFailed, total_start, err).await);
            }
        }
        let export_duration = export_start.elapsed();
        stages.push(("片段导出", export_duration));
        info!(
            "✅ [片段导出] 完成，耗时: {:.2}秒，成功 {} 个",
            export_duration.as_secs_f64(),
            metadata.processing.clips_exported
        );

        // 6. 元数据
        let metadata_start = Instant::now();
        finish(&mut metadata, &metadata_path, RunStatus::Completed, total_start).await?;
        let metadata_duration = metadata_start.elapsed();
        stages.push(("元数据写入", metadata_duration));
        info!("✅ [元数据] 写入完成: {}", metadata_path.display());

        log_summary(&stages, total_start.elapsed());
        info!("📁 [高光提取] 片段目录: {}", clips_dir.display());
        info!("🎞️  [高光提取] 片段数量: {}", metadata.clips.len());

        Ok(ProcessOutput {
            clips_dir,
            metadata_path,
            metadata,
            selection,
        })
    }

    /// 并发抽帧评分，失败的场景只记录诊断
    ///
    /// 失败比例超过阈值时中止剩余任务，错误中带回已经评分成功的候选。
    async fn score_windows(
        &self,
        video: &Path,
        windows: &[SceneWindow],
        total_duration: f64,
        sampler: Arc<FrameSampler>,
        metadata: &mut RunMetadata,
    ) -> Result<Vec<ScoredCandidate>, (Vec<ScoredCandidate>, HighlightError)> {
        let config = &self.config;
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let prior_scores: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = JoinSet::new();
        // 任务 id -> 场景编号，任务异常退出时用于补诊断
        let mut spawned = HashMap::new();

        for window in windows.iter().copied() {
            let semaphore = Arc::clone(&semaphore);
            let sampler = Arc::clone(&sampler);
            let scorer = Arc::clone(&self.scorer);
            let prior_scores = Arc::clone(&prior_scores);
            let retry = config.scoring_retry.clone();
            let optimize_for = config.optimize_for.clone();
            let genre = config.genre.clone();
            let video = video.to_path_buf();

            let handle = tasks.spawn(async move {
                let index = window.index();
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return WindowOutcome::ScoreFailed(
                            index,
                            HighlightError::ScoringFailed { scene_index: index, message: e.to_string() },
                        )
                    }
                };

                let frame = match sampler.sample(&video, &window).await {
                    Ok(frame) => frame,
                    Err(e) => return WindowOutcome::FrameFailed(index, e),
                };

                let context = ScoringContext {
                    scene_index: index,
                    timestamp: frame.offset,
                    duration: window.duration(),
                    position: VideoPosition::from_offset(frame.offset, total_duration),
                    optimize_for,
                    genre,
                    prior_scores: prior_scores.lock().await.clone(),
                    frame_hint: Some(frame.stats.describe()),
                };

                match score_with_retry(scorer.as_ref(), &frame.path, &context, &retry).await {
                    Ok(result) => {
                        prior_scores.lock().await.push(result.score);
                        WindowOutcome::Scored(ScoredCandidate {
                            window,
                            score: result.score,
                            label: result.label,
                            rationale: result.rationale,
                            frame_path: frame.path,
                        })
                    }
                    Err(e) => WindowOutcome::ScoreFailed(index, e),
                }
            });
            spawned.insert(handle.id(), window.index());
        }

        let mut scored = Vec::with_capacity(windows.len());
        let mut finished = 0usize;

        while let Some(joined) = tasks.join_next_with_id().await {
            finished += 1;
            match joined {
                Ok((_, WindowOutcome::Scored(candidate))) => {
                    debug!(
                        "🎯 [评分] 场景 {} 得分 {}: {}",
                        candidate.window.index(),
                        candidate.score,
                        candidate.label
                    );
                    metadata.processing.scenes_scored += 1;
                    scored.push(candidate);
                }
                Ok((_, WindowOutcome::FrameFailed(index, e))) => {
                    warn!("⚠️  [抽帧] 场景 {} 跳过: {}", index, e);
                    metadata.processing.frame_failures += 1;
                    metadata.diagnostics.push(Diagnostic::for_scene(Stage::FrameSampling, index, &e));
                }
                Ok((_, WindowOutcome::ScoreFailed(index, e))) => {
                    warn!("⚠️  [评分] 场景 {} 不参与排序: {}", index, e);
                    metadata.processing.scoring_failures += 1;
                    metadata.diagnostics.push(Diagnostic::for_scene(Stage::Scoring, index, &e));
                }
                Err(e) => {
                    error!("❌ [评分] 评分任务异常: {}", e);
                    metadata.processing.scoring_failures += 1;
                    if let Some(&index) = spawned.get(&e.id()) {
                        let err = HighlightError::ScoringFailed {
                            scene_index: index,
                            message: format!("评分任务异常: {}", e),
                        };
                        metadata.diagnostics.push(Diagnostic::for_scene(Stage::Scoring, index, &err));
                    }
                }
            }

            let failed = metadata.processing.scoring_failures;
            if finished >= config.abort_min_attempts
                && failed as f64 / finished as f64 > config.abort_failure_ratio
            {
                tasks.abort_all();
                metadata.diagnostics.sort_by_key(|d| d.scene_index);
                return Err((
                    scored,
                    HighlightError::Aborted {
                        failed,
                        attempted: finished,
                    },
                ));
            }
        }

        metadata.diagnostics.sort_by_key(|d| d.scene_index);
        Ok(scored)
    }
}

/// 处理视频文件
pub async fn process_video(
    video: impl AsRef<Path>,
    config: ProcessConfig,
    media: Arc<dyn MediaTool>,
    scorer: Arc<dyn Scorer>,
    dry_run: bool,
) -> HighlightResult<ProcessOutput> {
    Pipeline::new(config, media, scorer).run(video.as_ref(), dry_run).await
}

/// 终止性错误路径：尽量写入元数据，写入失败时仍返回原始错误
async fn fail(
    metadata: &mut RunMetadata,
    path: &Path,
    status: RunStatus,
    started: Instant,
    err: HighlightError,
) -> HighlightError {
    if let Err(write_err) = finish(metadata, path, status, started).await {
        warn!("⚠️  [元数据] 未能记录终止状态，返回原始错误 ({})", write_err);
    }
    err
}

async fn finish(
    metadata: &mut RunMetadata,
    path: &Path,
    status: RunStatus,
    started: Instant,
) -> HighlightResult<()> {
    metadata.status = status;
    metadata.processing.processing_time_secs = started.elapsed().as_secs_f64();
    metadata.write_atomic(path).await.map_err(|e| {
        error!("❌ [元数据] 写入元数据文件失败: {} - {}", path.display(), e);
        e
    })
}

fn log_summary(stages: &[(&str, Duration)], total: Duration) {
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(
        "🎉 [高光提取] 处理完成！总耗时: {:.2}秒 ({:.0}ms)",
        total.as_secs_f64(),
        total.as_millis()
    );
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("📊 [高光提取] 性能统计:");
    let total_secs = total.as_secs_f64().max(f64::EPSILON);
    for (name, elapsed) in stages {
        let percent = elapsed.as_secs_f64() / total_secs * 100.0;
        info!("   • {}: {:.2}秒 ({:.1}%)", name, elapsed.as_secs_f64(), percent);
    }
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

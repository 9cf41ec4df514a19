use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::{HighlightError, HighlightResult};
use crate::metadata::{Diagnostic, ExportedClip};
use crate::ranking::ScoredCandidate;
use crate::video_processor::{ExportMode, MediaTool};

/// 片段文件名：`{video_base}_clip_{rank:03}.{ext}`
pub fn clip_filename(video_base: &str, rank: usize, extension: &str) -> String {
    format!("{}_clip_{:03}.{}", video_base, rank, extension)
}

/// 片段导出器：把入选场景切成独立的视频文件
pub struct ClipExporter {
    media: Arc<dyn MediaTool>,
    clips_dir: PathBuf,
    extension: String,
    concurrency: usize,
}

impl ClipExporter {
    pub fn new(
        media: Arc<dyn MediaTool>,
        clips_dir: impl Into<PathBuf>,
        extension: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            media,
            clips_dir: clips_dir.into(),
            extension: extension.into(),
            concurrency: concurrency.max(1),
        }
    }

    /// dry run 时的片段记录：不写文件，file/path 为空
    pub fn plan(&self, selection: &[ScoredCandidate]) -> Vec<ExportedClip> {
        selection
            .iter()
            .enumerate()
            .map(|(i, candidate)| exported_clip(i + 1, candidate, None, None))
            .collect()
    }

    /// 导出所有入选片段
    ///
    /// 每个片段先尝试直接复制码流，失败再重新编码。单个片段失败只记录诊断，
    /// 返回的片段按排名排序。
    pub async fn export(
        &self,
        video: &Path,
        video_base: &str,
        selection: &[ScoredCandidate],
    ) -> (Vec<ExportedClip>, Vec<Diagnostic>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        // 任务 id -> (排名, 场景编号)，任务异常退出时用于补诊断
        let mut spawned = HashMap::new();

        for (i, candidate) in selection.iter().enumerate() {
            let rank = i + 1;
            let file = clip_filename(video_base, rank, &self.extension);
            let output = self.clips_dir.join(&file);
            let media = Arc::clone(&self.media);
            let semaphore = Arc::clone(&semaphore);
            let video = video.to_path_buf();
            let candidate = candidate.clone();
            let scene_index = candidate.window.index();

            let handle = tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => export_one(media.as_ref(), &video, &candidate, &output, rank).await,
                    Err(_) => Err(HighlightError::ClipExportFailed {
                        rank,
                        message: "并发控制已关闭".to_string(),
                    }),
                };
                (rank, candidate, file, output, result)
            });
            spawned.insert(handle.id(), (rank, scene_index));
        }

        let mut clips = Vec::with_capacity(selection.len());
        let mut diagnostics = Vec::new();

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, (rank, candidate, file, output, Ok(())))) => {
                    info!("✅ [片段导出] #{} -> {}", rank, output.display());
                    let path = output.to_string_lossy().to_string();
                    clips.push(exported_clip(rank, &candidate, Some(file), Some(path)));
                }
                Ok((_, (rank, candidate, _, _, Err(e)))) => {
                    warn!("⚠️  [片段导出] #{} 导出失败: {}", rank, e);
                    diagnostics.push(Diagnostic::for_clip(rank, candidate.window.index(), &e));
                }
                Err(e) => {
                    error!("❌ [片段导出] 导出任务异常: {}", e);
                    if let Some(&(rank, scene_index)) = spawned.get(&e.id()) {
                        let err = HighlightError::ClipExportFailed {
                            rank,
                            message: format!("导出任务异常: {}", e),
                        };
                        diagnostics.push(Diagnostic::for_clip(rank, scene_index, &err));
                    }
                }
            }
        }

        clips.sort_by_key(|c| c.rank);
        diagnostics.sort_by_key(|d| d.rank);
        (clips, diagnostics)
    }
}

async fn export_one(
    media: &dyn MediaTool,
    video: &Path,
    candidate: &ScoredCandidate,
    output: &Path,
    rank: usize,
) -> HighlightResult<()> {
    let start = candidate.window.start();
    let duration = candidate.window.duration();

    match media
        .extract_clip(video, start, duration, output, ExportMode::StreamCopy)
        .await
    {
        Ok(()) => Ok(()),
        Err(copy_err) => {
            warn!("流复制导出 #{} 失败，改为重新编码: {}", rank, copy_err);
            media
                .extract_clip(video, start, duration, output, ExportMode::Reencode)
                .await
                .map_err(|e| HighlightError::ClipExportFailed {
                    rank,
                    message: e.to_string(),
                })
        }
    }
}

fn exported_clip(
    rank: usize,
    candidate: &ScoredCandidate,
    file: Option<String>,
    path: Option<String>,
) -> ExportedClip {
    ExportedClip {
        rank,
        scene_index: candidate.window.index(),
        timestamp: candidate.window.start(),
        end: candidate.window.end(),
        duration: candidate.window.duration(),
        score: candidate.score,
        description: candidate.label.clone(),
        reasoning: candidate.rationale.clone(),
        file,
        path,
    }
}

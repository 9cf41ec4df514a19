use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{DiagnosticKind, HighlightError, HighlightResult};
use crate::ranking::CandidateSummary;
use crate::video_processor::CutDetection;

/// 运行最终状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    MediaUnavailable,
    NoValidScenes,
    AllExportsFailed,
    Aborted,
}

/// 产生诊断记录的流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    FrameSampling,
    Scoring,
    Export,
}

/// 单个场景或片段的失败记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub stage: Stage,
    pub kind: DiagnosticKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<usize>,
    pub message: String,
}

impl Diagnostic {
    pub fn for_scene(stage: Stage, scene_index: usize, error: &HighlightError) -> Self {
        Self {
            stage,
            kind: error.diagnostic_kind(),
            scene_index: Some(scene_index),
            rank: None,
            message: error.to_string(),
        }
    }

    pub fn for_clip(rank: usize, scene_index: usize, error: &HighlightError) -> Self {
        Self {
            stage: Stage::Export,
            kind: DiagnosticKind::ClipExportFailed,
            scene_index: Some(scene_index),
            rank: Some(rank),
            message: error.to_string(),
        }
    }
}

/// 视频信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoSection {
    /// 输入视频文件路径
    pub path: String,
    /// 不含扩展名的文件名
    pub name: String,
    /// 视频总时长（秒）
    pub duration: f64,
    /// 视频分辨率（宽x高）
    pub resolution: String,
    pub codec: String,
}

/// 各阶段计数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTotals {
    /// 工具报告的切点数
    pub cut_points_found: usize,
    /// 通过时长过滤的窗口数
    pub valid_windows: usize,
    /// 被 max_scenes 裁掉的窗口数
    pub windows_capped: usize,
    /// 是否使用了等长分段兜底
    pub used_chunk_fallback: bool,
    pub frame_failures: usize,
    pub scenes_scored: usize,
    pub scoring_failures: usize,
    pub clips_selected: usize,
    pub clips_exported: usize,
    pub processing_time_secs: f64,
}

/// 本次运行使用的配置快照（不含 API key）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub cut_detection: CutDetection,
    pub min_duration: f64,
    pub max_duration: f64,
    pub top_count: usize,
    pub max_scenes: usize,
    pub score_floor: u8,
    pub optimize_for: String,
    pub chunk_fallback: bool,
    pub oracle_model: String,
    pub concurrency: usize,
    pub abort_failure_ratio: f64,
}

/// 单个导出片段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedClip {
    /// 排名（从 1 开始）
    pub rank: usize,
    pub scene_index: usize,
    /// 片段开始时间（秒）
    pub timestamp: f64,
    pub end: f64,
    pub duration: f64,
    pub score: u8,
    pub description: String,
    pub reasoning: String,
    /// 片段文件名，dry run 时为 null
    pub file: Option<String>,
    /// 片段完整路径，dry run 时为 null
    pub path: Option<String>,
}

/// 一次运行的完整元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    /// RFC 3339 生成时间
    pub generated_at: String,
    pub status: RunStatus,
    pub dry_run: bool,
    pub video: VideoSection,
    pub config: ConfigSnapshot,
    pub processing: RunTotals,
    /// 所有评分成功的候选
    pub candidates: Vec<CandidateSummary>,
    pub clips: Vec<ExportedClip>,
    pub diagnostics: Vec<Diagnostic>,
}

impl RunMetadata {
    pub fn new(video: VideoSection, config: ConfigSnapshot, dry_run: bool) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            generated_at: chrono::Utc::now().to_rfc3339(),
            status: RunStatus::Completed,
            dry_run,
            video,
            config,
            processing: RunTotals::default(),
            candidates: Vec::new(),
            clips: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    /// 原子写入：先写同目录下的临时文件，再重命名覆盖
    pub async fn write_atomic(&self, path: &Path) -> HighlightResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(self)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| HighlightError::Config(format!("元数据路径无效: {}", path.display())))?;
        let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));

        tokio::fs::write(&tmp_path, &json).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 高光提取流程的结果类型
pub type HighlightResult<T> = Result<T, HighlightError>;

/// 高光提取过程中可能出现的错误
///
/// 只有 `MediaUnavailable`、`NoValidScenes`、`AllExportsFailed` 和 `Aborted` 会终止整次运行，
/// 其余均为单个场景级别的失败，由流水线记录到诊断列表后继续。
#[derive(Debug, Error)]
pub enum HighlightError {
    #[error("视频不可用: {path}: {message}")]
    MediaUnavailable { path: PathBuf, message: String },

    #[error("没有符合时长范围 [{min_duration:.1}s, {max_duration:.1}s] 的场景，请尝试放宽时长限制")]
    NoValidScenes { min_duration: f64, max_duration: f64 },

    #[error("场景 {scene_index} 抽帧失败: {message}")]
    FrameExtractionFailed { scene_index: usize, message: String },

    #[error("场景 {scene_index} 评分失败: {message}")]
    ScoringFailed { scene_index: usize, message: String },

    #[error("评分响应格式错误: {0}")]
    MalformedScore(String),

    #[error("片段 #{rank} 导出失败: {message}")]
    ClipExportFailed { rank: usize, message: String },

    #[error("所有 {0} 个入选片段均导出失败")]
    AllExportsFailed(usize),

    #[error("评分失败比例过高，运行已中止（{failed}/{attempted} 个场景评分失败）")]
    Aborted { failed: usize, attempted: usize },

    #[error("外部命令执行失败: {command}: {message}")]
    CommandFailed { command: String, message: String },

    #[error("操作超时（{0} 秒）")]
    Timeout(u64),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 解析错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),
}

impl HighlightError {
    pub fn media_unavailable(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::MediaUnavailable {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedScore(message.into())
    }

    /// 是否为终止整次运行的错误
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HighlightError::MediaUnavailable { .. }
                | HighlightError::NoValidScenes { .. }
                | HighlightError::AllExportsFailed(_)
                | HighlightError::Aborted { .. }
        )
    }

    /// 是否值得重试一次（超时、网络错误、格式错误）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HighlightError::Timeout(_)
                | HighlightError::Http(_)
                | HighlightError::MalformedScore(_)
                | HighlightError::CommandFailed { .. }
        )
    }

    /// 单场景失败对应的诊断类别
    pub fn diagnostic_kind(&self) -> DiagnosticKind {
        match self {
            HighlightError::FrameExtractionFailed { .. } => DiagnosticKind::FrameExtractionFailed,
            HighlightError::MalformedScore(_) => DiagnosticKind::MalformedScore,
            HighlightError::ClipExportFailed { .. } => DiagnosticKind::ClipExportFailed,
            _ => DiagnosticKind::ScoringFailed,
        }
    }
}

/// 写入运行元数据的诊断类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    FrameExtractionFailed,
    ScoringFailed,
    MalformedScore,
    ClipExportFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(HighlightError::media_unavailable("/tmp/x.mp4", "missing").is_fatal());
        assert!(HighlightError::NoValidScenes { min_duration: 5.0, max_duration: 45.0 }.is_fatal());
        assert!(HighlightError::AllExportsFailed(3).is_fatal());
        assert!(!HighlightError::FrameExtractionFailed { scene_index: 1, message: "x".into() }.is_fatal());
        assert!(!HighlightError::malformed("score 120").is_fatal());
    }

    #[test]
    fn test_malformed_maps_to_its_own_kind() {
        assert_eq!(HighlightError::malformed("bad").diagnostic_kind(), DiagnosticKind::MalformedScore);
        assert_eq!(
            HighlightError::ScoringFailed { scene_index: 0, message: "down".into() }.diagnostic_kind(),
            DiagnosticKind::ScoringFailed
        );
        assert_eq!(HighlightError::Timeout(30).diagnostic_kind(), DiagnosticKind::ScoringFailed);
    }

    #[test]
    fn test_no_valid_scenes_message_suggests_relaxing() {
        let msg = HighlightError::NoValidScenes { min_duration: 5.0, max_duration: 45.0 }.to_string();
        assert!(msg.contains("放宽"));
        assert!(msg.contains("5.0s"));
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::error::{HighlightError, HighlightResult};
use crate::retry::{retry_async, RetryConfig};

const MAX_LABEL_CHARS: usize = 100;
const MAX_RATIONALE_CHARS: usize = 500;

/// 场景在视频中的大致位置（按三等分）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoPosition {
    Early,
    Mid,
    Late,
}

impl VideoPosition {
    pub fn from_offset(offset: f64, total_duration: f64) -> Self {
        if total_duration <= 0.0 {
            return VideoPosition::Early;
        }
        let ratio = offset / total_duration;
        if ratio < 1.0 / 3.0 {
            VideoPosition::Early
        } else if ratio < 2.0 / 3.0 {
            VideoPosition::Mid
        } else {
            VideoPosition::Late
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoPosition::Early => "early",
            VideoPosition::Mid => "mid",
            VideoPosition::Late => "late",
        }
    }
}

/// 评分时附带给 oracle 的上下文
///
/// 这些字段只作为提示转发，评分失败时绝不能用它们在本地拼出一个分数。
#[derive(Debug, Clone)]
pub struct ScoringContext {
    pub scene_index: usize,
    /// 代表帧所在时间（秒）
    pub timestamp: f64,
    /// 场景时长（秒）
    pub duration: f64,
    pub position: VideoPosition,
    /// 优化目标，例如 "excitement"
    pub optimize_for: String,
    /// 可选的游戏类型或额外说明
    pub genre: Option<String>,
    /// 已完成评分的场景分数
    pub prior_scores: Vec<u8>,
    /// 帧统计描述
    pub frame_hint: Option<String>,
}

/// oracle 返回的评分结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub score: u8,
    pub label: String,
    pub rationale: String,
}

/// 评分能力接口
///
/// 具体 oracle（远程 API、本地模型、测试替身）都实现这个 trait，排序逻辑不关心具体实现。
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, frame: &Path, context: &ScoringContext) -> HighlightResult<ScoreResult>;
}

/// 构建评分提示词
pub fn build_prompt(context: &ScoringContext) -> String {
    let mut prompt = format!(
        "Analyze this gaming screenshot at {:.1}s.\n\n\
         Rate the {} level from 0-100 based on:\n\
         - 90-100: Epic plays (triple kills, clutch moments, rare achievements)\n\
         - 70-89: Good plays (double kills, skillful shots, winning plays)\n\
         - 50-69: Decent moments (average gameplay, some action)\n\
         - 0-49: Boring (low action, menus, loading screens)\n\n\
         Look for: kill feeds, score changes, special effects, intense action, multiple enemies, health bars.\n\n\
         Scene duration: {:.1}s, position in video: {}.",
        context.timestamp,
        context.optimize_for,
        context.duration,
        context.position.as_str()
    );

    if let Some(genre) = &context.genre {
        prompt.push_str(&format!("\nGame context: {}", genre));
    }
    if !context.prior_scores.is_empty() {
        let scores: Vec<String> = context.prior_scores.iter().map(|s| s.to_string()).collect();
        prompt.push_str(&format!("\nScores given to earlier scenes: {}", scores.join(", ")));
    }
    if let Some(hint) = &context.frame_hint {
        prompt.push_str(&format!("\n\nScene description:\n{}", hint));
    }

    prompt.push_str(
        "\n\nRespond with ONLY valid JSON:\n\
         {\"score\": 85, \"reasoning\": \"why this score based on what you see\", \
         \"description\": \"short catchy title for social media\"}",
    );
    prompt
}

/// 解析 oracle 的文本回复
///
/// 取第一个 `{` 到最后一个 `}` 之间的 JSON 对象。`score` 必须是 0..=100 的整数，
/// `description` 必须存在，否则返回 `MalformedScore`。
pub fn parse_score_response(text: &str) -> HighlightResult<ScoreResult> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &text[s..=e],
        _ => return Err(HighlightError::malformed(format!("回复中没有 JSON 对象: {}", preview(text)))),
    };

    let value: Value = serde_json::from_str(json)
        .map_err(|e| HighlightError::malformed(format!("JSON 无法解析: {}", e)))?;

    let score = value
        .get("score")
        .ok_or_else(|| HighlightError::malformed("缺少 score 字段"))
        .and_then(parse_score_value)?;

    let label = value
        .get("description")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HighlightError::malformed("缺少 description 字段"))?;

    let rationale = value
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim();

    Ok(ScoreResult {
        score,
        label: truncate_chars(label, MAX_LABEL_CHARS),
        rationale: truncate_chars(rationale, MAX_RATIONALE_CHARS),
    })
}

fn parse_score_value(value: &Value) -> HighlightResult<u8> {
    let raw = if let Some(n) = value.as_i64() {
        n
    } else if let Some(f) = value.as_f64().filter(|f| f.fract() == 0.0 && f.is_finite()) {
        f as i64
    } else {
        return Err(HighlightError::malformed(format!("score 不是整数: {}", value)));
    };

    if (0..=100).contains(&raw) {
        Ok(raw as u8)
    } else {
        Err(HighlightError::malformed(format!("score 超出 0-100 范围: {}", raw)))
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn preview(text: &str) -> String {
    truncate_chars(text, 80)
}

/// 调用评分器，失败时按重试策略再试一次
///
/// 最终失败时，格式错误保持为 `MalformedScore`，其余错误统一归为 `ScoringFailed`。
pub async fn score_with_retry(
    scorer: &dyn Scorer,
    frame: &Path,
    context: &ScoringContext,
    retry: &RetryConfig,
) -> HighlightResult<ScoreResult> {
    retry_async(retry, HighlightError::is_retryable, || scorer.score(frame, context))
        .await
        .map_err(|e| match e {
            HighlightError::MalformedScore(_) | HighlightError::ScoringFailed { .. } => e,
            other => HighlightError::ScoringFailed {
                scene_index: context.scene_index,
                message: other.to_string(),
            },
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn context() -> ScoringContext {
        ScoringContext {
            scene_index: 4,
            timestamp: 42.0,
            duration: 12.5,
            position: VideoPosition::Mid,
            optimize_for: "excitement".to_string(),
            genre: Some("Valorant".to_string()),
            prior_scores: vec![72, 40],
            frame_hint: Some("Frame resolution: 1920x1080".to_string()),
        }
    }

    #[derive(Clone, Copy)]
    enum Reply {
        Score(u8),
        Malformed,
        Timeout,
    }

    /// 按顺序返回预设结果的评分器，最后一个结果会一直重复
    struct ScriptedScorer {
        calls: AtomicU32,
        replies: Vec<Reply>,
    }

    #[async_trait]
    impl Scorer for ScriptedScorer {
        async fn score(&self, _frame: &Path, _context: &ScoringContext) -> HighlightResult<ScoreResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.replies[n.min(self.replies.len() - 1)] {
                Reply::Score(score) => Ok(ScoreResult { score, label: "flick".into(), rationale: String::new() }),
                Reply::Malformed => Err(HighlightError::malformed("score 120")),
                Reply::Timeout => Err(HighlightError::Timeout(30)),
            }
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::new("score").with_base_delay(Duration::from_millis(1))
    }

    #[test]
    fn test_position_thirds() {
        assert_eq!(VideoPosition::from_offset(10.0, 90.0), VideoPosition::Early);
        assert_eq!(VideoPosition::from_offset(45.0, 90.0), VideoPosition::Mid);
        assert_eq!(VideoPosition::from_offset(80.0, 90.0), VideoPosition::Late);
        assert_eq!(VideoPosition::from_offset(5.0, 0.0), VideoPosition::Early);
    }

    #[test]
    fn test_prompt_carries_rubric_and_hints() {
        let prompt = build_prompt(&context());
        assert!(prompt.contains("at 42.0s"));
        assert!(prompt.contains("90-100: Epic plays"));
        assert!(prompt.contains("position in video: mid"));
        assert!(prompt.contains("Game context: Valorant"));
        assert!(prompt.contains("72, 40"));
        assert!(prompt.contains("1920x1080"));
    }

    #[test]
    fn test_parse_wrapped_json() {
        let reply = "Sure! Here you go:\n```json\n{\"score\": 91, \"reasoning\": \"ace with a pistol\", \"description\": \"1v5 ace\"}\n```";
        let result = parse_score_response(reply).unwrap();
        assert_eq!(result.score, 91);
        assert_eq!(result.label, "1v5 ace");
        assert_eq!(result.rationale, "ace with a pistol");
    }

    #[test]
    fn test_parse_truncates_long_fields() {
        let reply = format!(
            "{{\"score\": 60, \"reasoning\": \"{}\", \"description\": \"{}\"}}",
            "r".repeat(800),
            "击杀".repeat(80)
        );
        let result = parse_score_response(&reply).unwrap();
        assert_eq!(result.rationale.chars().count(), 500);
        assert_eq!(result.label.chars().count(), 100);
    }

    #[test]
    fn test_parse_rejects_out_of_range_and_non_integer() {
        for reply in [
            r#"{"score": 150, "description": "x"}"#,
            r#"{"score": -1, "description": "x"}"#,
            r#"{"score": 72.5, "description": "x"}"#,
            r#"{"score": "high", "description": "x"}"#,
            r#"{"description": "x"}"#,
            r#"{"score": 80}"#,
            "no json at all",
        ] {
            let err = parse_score_response(reply).unwrap_err();
            assert!(matches!(err, HighlightError::MalformedScore(_)), "{}", reply);
        }
    }

    #[test]
    fn test_parse_accepts_whole_float_score() {
        let result = parse_score_response(r#"{"score": 88.0, "description": "clutch"}"#).unwrap();
        assert_eq!(result.score, 88);
        assert_eq!(result.rationale, "");
    }

    #[tokio::test]
    async fn test_retry_recovers_from_malformed_reply() {
        let scorer = ScriptedScorer {
            calls: AtomicU32::new(0),
            replies: vec![Reply::Malformed, Reply::Score(77)],
        };

        let result = score_with_retry(&scorer, Path::new("f.jpg"), &context(), &fast_retry()).await;
        assert_eq!(result.unwrap().score, 77);
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_failure_becomes_scoring_failed() {
        let scorer = ScriptedScorer {
            calls: AtomicU32::new(0),
            replies: vec![Reply::Timeout],
        };

        let err = score_with_retry(&scorer, Path::new("f.jpg"), &context(), &fast_retry())
            .await
            .unwrap_err();
        assert!(matches!(err, HighlightError::ScoringFailed { scene_index: 4, .. }));
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_malformed_keeps_its_kind() {
        let scorer = ScriptedScorer {
            calls: AtomicU32::new(0),
            replies: vec![Reply::Malformed],
        };

        let err = score_with_retry(&scorer, Path::new("f.jpg"), &context(), &fast_retry())
            .await
            .unwrap_err();
        assert!(matches!(err, HighlightError::MalformedScore(_)));
    }
}

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;

use crate::scene_detector::SceneWindow;

/// 已评分的候选场景，评分阶段结束后不再修改
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub window: SceneWindow,
    pub score: u8,
    pub label: String,
    pub rationale: String,
    pub frame_path: PathBuf,
}

/// 写入元数据的候选摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub index: usize,
    pub start: f64,
    pub end: f64,
    pub score: u8,
    pub label: String,
}

impl From<&ScoredCandidate> for CandidateSummary {
    fn from(candidate: &ScoredCandidate) -> Self {
        Self {
            index: candidate.window.index(),
            start: candidate.window.start(),
            end: candidate.window.end(),
            score: candidate.score,
            label: candidate.label.clone(),
        }
    }
}

/// 候选的全序：分数降序，同分按开始时间升序，再按窗口编号升序
pub fn rank_order(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| a.window.start().total_cmp(&b.window.start()))
        .then_with(|| a.window.index().cmp(&b.window.index()))
}

/// 两个候选窗口是否在时间上重叠
pub fn windows_overlap(a: &SceneWindow, b: &SceneWindow) -> bool {
    a.overlaps(b)
}

/// 选出前 K 个互不重叠的候选
///
/// 低于 `score_floor` 的候选先被丢弃；剩余候选按 `rank_order` 排序后贪心选取，
/// 与已选窗口重叠的直接跳过，选满 `k` 个为止。结果可以为空。
pub fn select(candidates: &[ScoredCandidate], k: usize, score_floor: u8) -> Vec<ScoredCandidate> {
    let mut pool: Vec<&ScoredCandidate> = candidates.iter().filter(|c| c.score >= score_floor).collect();
    pool.sort_by(|a, b| rank_order(a, b));

    let mut selection: Vec<ScoredCandidate> = Vec::with_capacity(k.min(pool.len()));
    for candidate in pool {
        if selection.len() >= k {
            break;
        }
        if selection.iter().any(|s| windows_overlap(&s.window, &candidate.window)) {
            continue;
        }
        selection.push(candidate.clone());
    }
    selection
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn candidate(index: usize, start: f64, end: f64, score: u8) -> ScoredCandidate {
        ScoredCandidate {
            window: SceneWindow::new(index, start, end).unwrap(),
            score,
            label: format!("scene {}", index),
            rationale: String::new(),
            frame_path: PathBuf::from(format!("frames/scene_{:03}.jpg", index)),
        }
    }

    fn indices(selection: &[ScoredCandidate]) -> Vec<usize> {
        selection.iter().map(|c| c.window.index()).collect()
    }

    #[test]
    fn test_overlapping_lower_score_rejected() {
        let pool = vec![candidate(0, 0.0, 10.0, 90), candidate(1, 5.0, 15.0, 85)];
        let selection = select(&pool, 2, 0);
        assert_eq!(indices(&selection), vec![0]);
    }

    #[test]
    fn test_ties_broken_by_start_time() {
        let pool = vec![
            candidate(3, 40.0, 50.0, 70),
            candidate(1, 10.0, 20.0, 70),
            candidate(2, 25.0, 35.0, 95),
        ];
        let selection = select(&pool, 3, 0);
        assert_eq!(indices(&selection), vec![2, 1, 3]);
    }

    #[test]
    fn test_k_bounds_selection() {
        let pool: Vec<_> = (0..6)
            .map(|i| candidate(i, i as f64 * 10.0, i as f64 * 10.0 + 8.0, 50 + i as u8))
            .collect();
        let selection = select(&pool, 3, 0);
        assert_eq!(indices(&selection), vec![5, 4, 3]);
        assert!(select(&pool, 0, 0).is_empty());
    }

    #[test]
    fn test_score_floor() {
        let pool = vec![candidate(0, 0.0, 10.0, 40), candidate(1, 20.0, 30.0, 75)];
        assert_eq!(indices(&select(&pool, 3, 50)), vec![1]);
        assert!(select(&pool, 3, 90).is_empty());
    }

    #[test]
    fn test_empty_pool() {
        assert!(select(&[], 3, 0).is_empty());
    }

    #[test]
    fn test_touching_windows_both_selected() {
        let pool = vec![candidate(0, 0.0, 10.0, 80), candidate(1, 10.0, 20.0, 60)];
        assert_eq!(indices(&select(&pool, 2, 0)), vec![0, 1]);
    }

    #[test]
    fn test_selection_is_idempotent() {
        let pool = vec![
            candidate(0, 0.0, 12.0, 64),
            candidate(1, 8.0, 20.0, 88),
            candidate(2, 20.0, 31.0, 88),
            candidate(3, 30.0, 44.0, 12),
        ];
        let first = select(&pool, 3, 0);
        let second = select(&first, 3, 0);
        assert_eq!(first, second);
        assert_eq!(first, select(&pool, 3, 0));
    }

    fn arb_candidates() -> impl Strategy<Value = Vec<ScoredCandidate>> {
        proptest::collection::vec((0.0f64..300.0, 1.0f64..60.0, 0u8..=100), 0..30).prop_map(|spans| {
            spans
                .into_iter()
                .enumerate()
                .map(|(i, (start, len, score))| candidate(i, start, start + len, score))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_selection_bounded_and_disjoint(pool in arb_candidates(), k in 0usize..8, floor in 0u8..=100) {
            let selection = select(&pool, k, floor);
            prop_assert!(selection.len() <= k);
            for (i, a) in selection.iter().enumerate() {
                prop_assert!(a.score >= floor);
                for b in &selection[i + 1..] {
                    prop_assert!(!windows_overlap(&a.window, &b.window));
                    prop_assert!(rank_order(a, b) != Ordering::Greater);
                }
            }
        }

        #[test]
        fn prop_selection_ignores_input_order(pool in arb_candidates(), k in 0usize..8) {
            let mut reversed = pool.clone();
            reversed.reverse();
            prop_assert_eq!(select(&pool, k, 0), select(&reversed, k, 0));
        }
    }
}

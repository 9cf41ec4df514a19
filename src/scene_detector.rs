use tracing::debug;

/// 一个候选场景窗口 `[start, end)`
///
/// 只能通过 `SceneWindow::new` 构造，保证 `end > start`；时长总是由起止时间推导。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneWindow {
    index: usize,
    start: f64,
    end: f64,
}

impl SceneWindow {
    pub fn new(index: usize, start: f64, end: f64) -> Option<Self> {
        if start.is_finite() && end.is_finite() && end > start {
            Some(Self { index, start, end })
        } else {
            None
        }
    }

    /// 窗口在边界序列中的位置（过滤前的编号，过滤后不重新编号）
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// 场景中点，用作代表帧的抽取位置
    pub fn midpoint(&self) -> f64 {
        (self.start + self.end) / 2.0
    }

    /// 两个窗口在时间上是否重叠：`max(a.start, b.start) < min(a.end, b.end)`
    pub fn overlaps(&self, other: &SceneWindow) -> bool {
        self.start.max(other.start) < self.end.min(other.end)
    }
}

/// 候选场景构建器：把切点序列转换为满足时长限制的场景窗口
pub struct SceneDetector {
    /// 最小场景持续时间（秒）
    min_duration: f64,
    /// 最大场景持续时间（秒）
    max_duration: f64,
}

impl SceneDetector {
    pub fn new(min_duration: f64, max_duration: f64) -> Self {
        Self {
            min_duration,
            max_duration,
        }
    }

    /// 构建场景窗口
    ///
    /// 在切点前补 0.0、后补总时长（已存在时不重复补），得到 N+1 个边界和 N 个相邻窗口。
    /// 不单调递增（重复或倒序）以及超出 `[0, total_duration]` 的边界会被丢弃而不是截断，
    /// 然后只保留 `min_duration <= duration <= max_duration` 的窗口。
    /// 窗口编号是其左边界在补全后序列中的原始位置，丢弃边界不会让后面的窗口重新编号。
    /// 返回空列表不是错误，由调用方报告为 `NoValidScenes`。
    pub fn build_windows(&self, timestamps: &[f64], total_duration: f64) -> Vec<SceneWindow> {
        if !total_duration.is_finite() || total_duration <= 0.0 {
            return Vec::new();
        }

        let head = (timestamps.first() != Some(&0.0)).then_some(0.0);
        let tail = (timestamps.last() != Some(&total_duration)).then_some(total_duration);

        // (原始位置, 时间)
        let mut boundaries: Vec<(usize, f64)> = Vec::with_capacity(timestamps.len() + 2);
        let raw = head
            .into_iter()
            .chain(timestamps.iter().copied())
            .chain(tail)
            .enumerate();

        for (position, boundary) in raw {
            if !boundary.is_finite() || boundary < 0.0 || boundary > total_duration {
                debug!("丢弃越界切点: #{} {}", position, boundary);
                continue;
            }
            if let Some(&(_, last)) = boundaries.last() {
                if boundary <= last {
                    debug!("丢弃非单调切点: #{} {} (上一个边界 {})", position, boundary, last);
                    continue;
                }
            }
            boundaries.push((position, boundary));
        }

        boundaries
            .windows(2)
            .filter_map(|pair| SceneWindow::new(pair[0].0, pair[0].1, pair[1].1))
            .filter(|w| self.accepts(w.duration()))
            .collect()
    }

    /// 时长过滤后没有任何窗口时的兜底方案：把视频切成等长小段
    ///
    /// 每段 `min(15, total/5)` 秒，至少 3 段，丢弃短于 1 秒的尾段。
    pub fn fallback_chunks(&self, total_duration: f64) -> Vec<SceneWindow> {
        if !total_duration.is_finite() || total_duration <= 0.0 {
            return Vec::new();
        }

        let chunk = (total_duration / 5.0).min(15.0);
        let count = ((total_duration / chunk) as usize).max(3);

        (0..count)
            .filter_map(|i| {
                let start = i as f64 * chunk;
                let end = ((i + 1) as f64 * chunk).min(total_duration);
                SceneWindow::new(i, start, end)
            })
            .filter(|w| w.duration() >= 1.0)
            .collect()
    }

    fn accepts(&self, duration: f64) -> bool {
        self.min_duration <= duration && duration <= self.max_duration
    }
}

/// 只保留前 `max_scenes` 个窗口（0 表示不限制），返回被裁掉的数量
pub fn limit_windows(mut windows: Vec<SceneWindow>, max_scenes: usize) -> (Vec<SceneWindow>, usize) {
    if max_scenes == 0 || windows.len() <= max_scenes {
        return (windows, 0);
    }
    let dropped = windows.len() - max_scenes;
    windows.truncate(max_scenes);
    (windows, dropped)
}

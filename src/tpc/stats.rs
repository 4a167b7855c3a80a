//! 事务状态缓存统计
//!
//! 记录块命中、页加载和状态变更次数

use std::sync::atomic::{AtomicU64, Ordering};

/// 事务状态缓存统计
#[derive(Debug, Default)]
pub struct TpcStats {
    hits: AtomicU64,
    misses: AtomicU64,
    blocks_released: AtomicU64,
    state_changes: AtomicU64,
    commits: AtomicU64,
}

impl TpcStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录块命中
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录块未命中（需要读 TIP 页）
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self, blocks: u64) {
        self.blocks_released.fetch_add(blocks, Ordering::Relaxed);
    }

    pub fn record_state_change(&self, committed: bool) {
        self.state_changes.fetch_add(1, Ordering::Relaxed);
        if committed {
            self.commits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> TpcStatsSnapshot {
        TpcStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            blocks_released: self.blocks_released.load(Ordering::Relaxed),
            state_changes: self.state_changes.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
        }
    }
}

/// 统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpcStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub blocks_released: u64,
    pub state_changes: u64,
    pub commits: u64,
}

impl TpcStatsSnapshot {
    /// 命中率
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

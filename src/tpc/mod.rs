// 事务状态缓存
//
// TIP 内容在内存中的镜像。每个事务对应一个提交号（CN）：
// 史前 < 普通提交号 < ACTIVE < LIMBO < DEAD。
// 所有状态变更经过 set_state，在同一临界区内更新 TIP 页与缓存。

pub mod stats;

pub use stats::{TpcStats, TpcStatsSnapshot};

use crate::error::{TxError, TxResult};
use crate::tip::{TipLayout, TipStore, WriteHint};
use crate::transactions::{TraNumber, TraState};
use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// 提交号
pub type CommitNumber = u64;

/// 从磁盘加载的已提交事务，早于任何快照
pub const CN_PREHISTORIC: CommitNumber = 1;
pub const CN_DEAD: CommitNumber = u64::MAX;
pub const CN_LIMBO: CommitNumber = u64::MAX - 1;
pub const CN_ACTIVE: CommitNumber = u64::MAX - 2;
/// 普通提交号的上限
pub const CN_MAX_NUMBER: CommitNumber = u64::MAX - 3;

bitflags! {
    /// find_first_in_range 的状态掩码
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StateMask: u8 {
        const ACTIVE    = 1 << 0;
        const LIMBO     = 1 << 1;
        const DEAD      = 1 << 2;
        const COMMITTED = 1 << 3;
    }
}

impl StateMask {
    fn matches(&self, cn: CommitNumber) -> bool {
        match cn {
            CN_ACTIVE => self.contains(StateMask::ACTIVE),
            CN_LIMBO => self.contains(StateMask::LIMBO),
            CN_DEAD => self.contains(StateMask::DEAD),
            _ => self.contains(StateMask::COMMITTED),
        }
    }
}

/// 提交号对应的状态
pub fn cn_to_state(cn: CommitNumber) -> TraState {
    match cn {
        CN_ACTIVE => TraState::Active,
        CN_LIMBO => TraState::Limbo,
        CN_DEAD => TraState::Dead,
        _ => TraState::Committed,
    }
}

fn loaded_cn(state: TraState) -> CommitNumber {
    match state {
        TraState::Active => CN_ACTIVE,
        TraState::Limbo => CN_LIMBO,
        TraState::Dead => CN_DEAD,
        _ => CN_PREHISTORIC,
    }
}

/// 一个 TIP 页对应的缓存块
struct StatesBlock {
    first: TraNumber,
    cns: Vec<AtomicU64>,
}

impl StatesBlock {
    fn slot(&self, id: TraNumber) -> &AtomicU64 {
        &self.cns[(id - self.first) as usize]
    }
}

/// 已登记的快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHandle {
    id: u64,
    /// 拥有该快照的事务
    pub owner: TraNumber,
    /// 快照提交号
    pub number: CommitNumber,
}

#[derive(Default)]
struct SnapshotRegistry {
    next_id: u64,
    entries: BTreeMap<u64, (TraNumber, CommitNumber)>,
}

/// 事务状态缓存
pub struct TipCache {
    tip: Arc<TipStore>,
    layout: TipLayout,
    blocks: RwLock<BTreeMap<u64, Arc<StatesBlock>>>,
    /// 低于该页序号的块已释放
    base_sequence: AtomicU64,
    latest_cn: AtomicU64,
    state_lock: Mutex<()>,
    snapshots: Mutex<SnapshotRegistry>,
    stats: TpcStats,
}

impl TipCache {
    pub fn new(tip: Arc<TipStore>, oldest_interesting: TraNumber) -> Self {
        let layout = tip.layout();
        Self {
            base_sequence: AtomicU64::new(layout.page_sequence(oldest_interesting)),
            tip,
            layout,
            blocks: RwLock::new(BTreeMap::new()),
            latest_cn: AtomicU64::new(CN_PREHISTORIC),
            state_lock: Mutex::new(()),
            snapshots: Mutex::new(SnapshotRegistry::default()),
            stats: TpcStats::new(),
        }
    }

    pub fn tip(&self) -> &Arc<TipStore> {
        &self.tip
    }

    fn lookup(&self, sequence: u64) -> Option<Arc<StatesBlock>> {
        self.blocks.read().get(&sequence).cloned()
    }

    /// 读取 TIP 页建立缓存块，调用方须持有 state_lock
    fn load_block(&self, sequence: u64) -> TxResult<Arc<StatesBlock>> {
        if let Some(block) = self.lookup(sequence) {
            return Ok(block);
        }
        self.stats.record_miss();
        let states = self.tip.page_states(sequence)?;
        let block = Arc::new(StatesBlock {
            first: self.layout.first_id(sequence),
            cns: states
                .into_iter()
                .map(|s| AtomicU64::new(loaded_cn(s)))
                .collect(),
        });
        self.blocks.write().insert(sequence, block.clone());
        trace!(sequence, "loaded TIP block into cache");
        Ok(block)
    }

    /// 返回 None 表示该块已释放（史前）
    fn block(&self, sequence: u64) -> TxResult<Option<Arc<StatesBlock>>> {
        if sequence < self.base_sequence.load(Ordering::Acquire) {
            return Ok(None);
        }
        if let Some(block) = self.lookup(sequence) {
            self.stats.record_hit();
            return Ok(Some(block));
        }
        let _guard = self.state_lock.lock();
        self.load_block(sequence).map(Some)
    }

    /// 事务的提交号
    pub fn snapshot_state(&self, id: TraNumber) -> TxResult<CommitNumber> {
        match self.block(self.layout.page_sequence(id))? {
            Some(block) => Ok(block.slot(id).load(Ordering::Acquire)),
            None => Ok(CN_PREHISTORIC),
        }
    }

    /// 事务的字面状态
    ///
    /// 缓存块已释放的事务号对可见性而言是史前的，但字面状态仍以 TIP 为准。
    pub fn cache_state(&self, id: TraNumber) -> TxResult<TraState> {
        match self.block(self.layout.page_sequence(id))? {
            Some(block) => Ok(cn_to_state(block.slot(id).load(Ordering::Acquire))),
            None => self.tip.get_state(id),
        }
    }

    /// 更新 TIP 与缓存中的状态，已提交事务分配新的提交号
    pub fn set_state(&self, id: TraNumber, state: TraState, hint: WriteHint) -> TxResult<CommitNumber> {
        self.transition(id, state, Some(hint))
    }

    /// 只更新缓存（TIP 写入失败后使用）
    pub fn set_cache_state(&self, id: TraNumber, state: TraState) -> TxResult<CommitNumber> {
        self.transition(id, state, None)
    }

    fn transition(
        &self,
        id: TraNumber,
        state: TraState,
        persist: Option<WriteHint>,
    ) -> TxResult<CommitNumber> {
        let sequence = self.layout.page_sequence(id);
        let _guard = self.state_lock.lock();
        if sequence < self.base_sequence.load(Ordering::Acquire) {
            return Err(TxError::consistency(format!(
                "transaction {} is below the oldest interesting transaction",
                id
            )));
        }
        let block = self.load_block(sequence)?;
        let slot = block.slot(id);
        let current = slot.load(Ordering::Acquire);
        let current_state = cn_to_state(current);
        let target = if state == TraState::Precommitted {
            TraState::Committed
        } else {
            state
        };

        if current_state == target {
            return Ok(current);
        }
        let allowed = match (current_state, target) {
            (TraState::Active, TraState::Limbo | TraState::Dead | TraState::Committed) => true,
            (TraState::Limbo, TraState::Dead | TraState::Committed) => true,
            _ => false,
        };
        if !allowed {
            return Err(TxError::consistency(format!(
                "transaction {} cannot change from {} to {}",
                id, current_state, state
            )));
        }

        if let Some(hint) = persist {
            self.tip.set_state(id, target, hint)?;
        }

        let cn = match target {
            TraState::Committed => {
                let cn = self.latest_cn.load(Ordering::Acquire) + 1;
                if cn > CN_MAX_NUMBER {
                    return Err(TxError::consistency("commit number space exhausted"));
                }
                self.latest_cn.store(cn, Ordering::Release);
                cn
            }
            TraState::Limbo => CN_LIMBO,
            TraState::Dead => CN_DEAD,
            _ => CN_ACTIVE,
        };
        slot.store(cn, Ordering::Release);
        self.stats.record_state_change(target == TraState::Committed);
        debug!(id, from = %current_state, to = %state, cn, "transaction state changed");
        Ok(cn)
    }

    /// 在 [lo, hi) 中查找第一个状态匹配的事务
    pub fn find_first_in_range(
        &self,
        lo: TraNumber,
        hi: TraNumber,
        mask: StateMask,
    ) -> TxResult<Option<TraNumber>> {
        if lo >= hi {
            return Ok(None);
        }
        let tpp = self.layout.transactions_per_page();
        let mut id = lo;
        while id < hi {
            let sequence = self.layout.page_sequence(id);
            let page_end = (self.layout.first_id(sequence) + tpp).min(hi);
            match self.block(sequence)? {
                None => {
                    if mask.contains(StateMask::COMMITTED) {
                        return Ok(Some(id));
                    }
                }
                Some(block) => {
                    for candidate in id..page_end {
                        if mask.matches(block.slot(candidate).load(Ordering::Acquire)) {
                            return Ok(Some(candidate));
                        }
                    }
                }
            }
            id = page_end;
        }
        Ok(None)
    }

    pub fn latest_commit_number(&self) -> CommitNumber {
        self.latest_cn.load(Ordering::Acquire)
    }

    /// 登记一个快照，固定当前最新提交号
    pub fn begin_snapshot(&self, owner: TraNumber) -> SnapshotHandle {
        // 与 set_state 互斥，保证提交号已写入缓存块
        let _guard = self.state_lock.lock();
        let number = self.latest_cn.load(Ordering::Acquire);
        let mut registry = self.snapshots.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.insert(id, (owner, number));
        SnapshotHandle { id, owner, number }
    }

    pub fn end_snapshot(&self, handle: SnapshotHandle) {
        self.snapshots.lock().entries.remove(&handle.id);
    }

    /// 把快照转交给新的事务号，提交号不变
    pub fn retarget_snapshot(&self, handle: &mut SnapshotHandle, owner: TraNumber) {
        if let Some(entry) = self.snapshots.lock().entries.get_mut(&handle.id) {
            entry.0 = owner;
        }
        handle.owner = owner;
    }

    /// 仍被快照引用的最小提交号
    pub fn oldest_snapshot_number(&self) -> CommitNumber {
        self.snapshots
            .lock()
            .entries
            .values()
            .map(|(_, cn)| *cn)
            .min()
            .unwrap_or_else(|| self.latest_commit_number())
    }

    /// 持有快照的最老事务
    pub fn oldest_snapshot_owner(&self) -> Option<TraNumber> {
        self.snapshots
            .lock()
            .entries
            .values()
            .map(|(owner, _)| *owner)
            .min()
    }

    pub fn active_snapshots(&self) -> usize {
        self.snapshots.lock().entries.len()
    }

    /// OIT 推进后释放其下的整页缓存块，返回释放的块数
    pub fn update_oldest(&self, oldest_interesting: TraNumber) -> usize {
        let new_base = self.layout.page_sequence(oldest_interesting);
        let _guard = self.state_lock.lock();
        if new_base <= self.base_sequence.load(Ordering::Acquire) {
            return 0;
        }
        self.base_sequence.store(new_base, Ordering::Release);
        let mut blocks = self.blocks.write();
        let keep = blocks.split_off(&new_base);
        let released = blocks.len();
        *blocks = keep;
        self.stats.record_release(released as u64);
        debug!(new_base, released, "released cached TIP blocks");
        released
    }

    pub fn cached_blocks(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn stats(&self) -> TpcStatsSnapshot {
        self.stats.snapshot()
    }
}

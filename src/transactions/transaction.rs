// 事务控制块
//
// 记录一个事务在其生命周期内的全部状态：事务号、隔离级别、标志、
// 存活锁、可见性快照、保存点栈、已登记资源和延迟工作。
// 控制块只属于创建它的连接，其他连接只能通过事务号和存活锁观察它。

use super::resources::{DeferredWork, PostedResources, ResourceRef};
use super::savepoint::{SavepointHandle, SavepointStack, UndoAction};
use super::{IsolationMode, TraFlags, TraNumber, TraState, TransactionOptions};
use crate::error::{TxError, TxResult};
use crate::lock::{LockId, LockOwner, LockWait};
use crate::tpc::{CommitNumber, SnapshotHandle};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;

/// 可见性快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// 低于它的事务对本事务都是已提交的
    pub oldest: TraNumber,
    /// 启动时仍可能在运行的最老事务
    pub oldest_active: TraNumber,
    /// 启动时固定的提交号；读已提交事务仅作参考
    pub number: CommitNumber,
}

/// 提交或回滚的结果
#[derive(Debug)]
pub enum CommitOutcome {
    /// 事务已结束并释放
    Released,
    /// 保留上下文：调用方用票据换出新的事务号
    Retained(RetainTicket),
    /// 没有任何需要结束的工作，事务号不变
    Kept,
}

/// 保留提交/回滚分配的新事务号和存活锁
#[derive(Debug)]
#[must_use]
pub struct RetainTicket {
    number: TraNumber,
    lock: LockId,
    previous: TraNumber,
    previous_committed: bool,
}

impl RetainTicket {
    pub(crate) fn new(number: TraNumber, lock: LockId, previous: TraNumber) -> Self {
        Self {
            number,
            lock,
            previous,
            previous_committed: false,
        }
    }

    pub(crate) fn set_previous_committed(&mut self, committed: bool) {
        self.previous_committed = committed;
    }

    pub(crate) fn lock(&self) -> LockId {
        self.lock
    }

    pub fn number(&self) -> TraNumber {
        self.number
    }

    pub fn previous(&self) -> TraNumber {
        self.previous
    }
}

/// 事务
pub struct Transaction {
    number: TraNumber,
    isolation: IsolationMode,
    options: TransactionOptions,
    pub(crate) flags: TraFlags,
    lock_wait: LockWait,
    owner: LockOwner,
    /// 存活锁；预提交后或释放后为 None
    pub(crate) lock: Option<LockId>,
    snapshot: Snapshot,
    pub(crate) snapshot_handle: Option<SnapshotHandle>,
    /// 读一致性下当前语句固定的提交号
    pub(crate) statement: Option<SnapshotHandle>,
    pub(crate) request_depth: u32,
    /// 保留提交前用过的事务号，对本事务直接视为已提交
    commit_sub_trans: BTreeSet<TraNumber>,
    pub(crate) savepoints: SavepointStack,
    pub(crate) resources: PostedResources,
    pub(crate) reservation_locks: Vec<LockId>,
    pub(crate) deferred: Vec<Box<dyn DeferredWork>>,
    pub(crate) post_commit: Vec<Box<dyn DeferredWork>>,
    outer: Option<TraNumber>,
    pub(crate) description: Option<Vec<u8>>,
    pub(crate) released: bool,
    /// 结束时写入的最终状态
    pub(crate) final_state: Option<TraState>,
    started_at: DateTime<Utc>,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        number: TraNumber,
        isolation: IsolationMode,
        options: TransactionOptions,
        flags: TraFlags,
        lock_wait: LockWait,
        owner: LockOwner,
        lock: LockId,
        snapshot: Snapshot,
        outer: Option<TraNumber>,
    ) -> Self {
        Self {
            number,
            isolation,
            options,
            flags,
            lock_wait,
            owner,
            lock: Some(lock),
            snapshot,
            snapshot_handle: None,
            statement: None,
            request_depth: 0,
            commit_sub_trans: BTreeSet::new(),
            savepoints: SavepointStack::new(),
            resources: PostedResources::new(),
            reservation_locks: Vec::new(),
            deferred: Vec::new(),
            post_commit: Vec::new(),
            outer,
            description: None,
            released: false,
            final_state: None,
            started_at: Utc::now(),
        }
    }

    pub fn number(&self) -> TraNumber {
        self.number
    }

    pub fn isolation(&self) -> IsolationMode {
        self.isolation
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn flags(&self) -> TraFlags {
        self.flags
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
    }

    pub fn lock_wait(&self) -> LockWait {
        self.lock_wait
    }

    pub fn owner(&self) -> LockOwner {
        self.owner
    }

    pub fn outer(&self) -> Option<TraNumber> {
        self.outer
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn description(&self) -> Option<&[u8]> {
        self.description.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(TraFlags::READ_ONLY)
    }

    pub fn is_read_committed(&self) -> bool {
        self.isolation.is_read_committed()
    }

    pub fn wrote(&self) -> bool {
        self.flags.contains(TraFlags::WRITE)
    }

    pub fn is_prepared(&self) -> bool {
        self.flags.contains(TraFlags::PREPARED)
    }

    pub fn is_invalidated(&self) -> bool {
        self.flags.contains(TraFlags::INVALIDATED)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn final_state(&self) -> Option<TraState> {
        self.final_state
    }

    /// 读一致性语句快照的提交号
    pub fn statement_snapshot(&self) -> Option<CommitNumber> {
        self.statement.map(|s| s.number)
    }

    pub fn is_commit_sub_trans(&self, number: TraNumber) -> bool {
        self.commit_sub_trans.contains(&number)
    }

    pub fn commit_sub_trans(&self) -> impl Iterator<Item = TraNumber> + '_ {
        self.commit_sub_trans.iter().copied()
    }

    pub fn posted_resources(&self) -> impl Iterator<Item = &ResourceRef> {
        self.resources.iter()
    }

    pub fn savepoint_depth(&self) -> usize {
        self.savepoints.depth()
    }

    pub fn has_deferred_work(&self) -> bool {
        !self.deferred.is_empty()
    }

    pub(crate) fn set_snapshot(&mut self, snapshot: Snapshot) {
        self.snapshot = snapshot;
    }

    /// 标记事务已修改数据
    pub fn mark_write(&mut self) -> TxResult<()> {
        if self.flags.writable() {
            self.flags.insert(TraFlags::WRITE);
            return Ok(());
        }
        if self.flags.contains(TraFlags::INVALIDATED) {
            return Err(TxError::TransactionInvalidated(self.number));
        }
        if self.flags.contains(TraFlags::READ_ONLY) {
            return Err(TxError::ReadOnlyTransaction(self.number));
        }
        let reason = if self.flags.contains(TraFlags::PREPARED) {
            "transaction is prepared"
        } else if self.flags.contains(TraFlags::RECONNECTED) {
            "transaction is reconnected"
        } else {
            "transaction is precommitted"
        };
        Err(TxError::NotAllowed {
            number: self.number,
            reason: reason.into(),
        })
    }

    /// 在当前保存点记录撤销动作
    pub fn post_undo(&mut self, action: Box<dyn UndoAction>) {
        self.savepoints.post_undo(action);
    }

    pub fn start_savepoint(&mut self, name: Option<&str>) -> SavepointHandle {
        self.savepoints.start(name)
    }

    pub fn rollback_savepoint(&mut self, handle: SavepointHandle) -> TxResult<()> {
        self.savepoints.rollback(handle)
    }

    pub fn release_savepoint(&mut self, handle: SavepointHandle) -> TxResult<()> {
        self.savepoints.release(handle)
    }

    pub fn find_savepoint(&self, name: &str) -> Option<SavepointHandle> {
        self.savepoints.find(name)
    }

    pub fn defer_work(&mut self, work: Box<dyn DeferredWork>) {
        self.deferred.push(work);
    }

    /// 保留上下文：换入新的事务号和存活锁
    ///
    /// 快照、已登记资源和预留锁保持不变；写标志和保存点被丢弃，
    /// 旧事务号已提交时记入 commit_sub_trans。
    pub fn retain(mut self, ticket: RetainTicket) -> Transaction {
        if ticket.previous_committed {
            self.commit_sub_trans.insert(ticket.previous);
        }
        self.number = ticket.number;
        self.lock = Some(ticket.lock);
        self.flags.remove(TraFlags::WRITE | TraFlags::PREPARED | TraFlags::RECONNECTED);
        self.description = None;
        self.post_commit.clear();
        self.savepoints = SavepointStack::new();
        if !self.flags.contains(TraFlags::NO_AUTO_UNDO) {
            self.savepoints.start(None);
        }
        self.released = false;
        self.final_state = None;
        self
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("number", &self.number)
            .field("isolation", &self.isolation)
            .field("flags", &self.flags)
            .field("snapshot", &self.snapshot)
            .field("savepoints", &self.savepoints)
            .field("deferred", &self.deferred.len())
            .field("released", &self.released)
            .finish()
    }
}

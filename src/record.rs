// 记录版本
//
// 最小的多版本记录表：每个键对应一条按新到旧排列的版本链，
// 每个版本带有写入它的事务号。读取时沿版本链用 snapshot_state 判定可见性，
// 写入时检查更新冲突并在当前保存点登记撤销动作。
// 表同时实现 GarbageCollector，供清扫清理已死事务留下的版本。

use crate::attachment::{Attachment, TransactionHandle};
use crate::database::DatabaseShared;
use crate::error::{TxError, TxResult};
use crate::sweep::GarbageCollector;
use crate::transactions::{
    snapshot_state, wait_for, IsolationMode, ReadCommittedMode, TraFlags, TraNumber, TraState,
    Transaction,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// 记录的一个版本，`data` 为 None 表示删除标记
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordVersion {
    pub writer: TraNumber,
    pub data: Option<Vec<u8>>,
}

/// 版本链，最新版本在前
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionChain {
    versions: Vec<RecordVersion>,
}

impl VersionChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, version: RecordVersion) {
        self.versions.insert(0, version);
    }

    pub fn versions(&self) -> &[RecordVersion] {
        &self.versions
    }

    pub fn newest(&self) -> Option<&RecordVersion> {
        self.versions.first()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// 撤销：移除该事务最新的一个版本
    fn undo_newest(&mut self, writer: TraNumber) -> bool {
        match self.versions.iter().position(|v| v.writer == writer) {
            Some(pos) => {
                self.versions.remove(pos);
                true
            }
            None => false,
        }
    }

    /// 移除该事务的全部版本，返回移除数量
    fn purge(&mut self, writer: TraNumber) -> usize {
        let before = self.versions.len();
        self.versions.retain(|v| v.writer != writer);
        before - self.versions.len()
    }
}

/// 多版本记录表
pub struct RecordTable {
    name: String,
    rows: RwLock<BTreeMap<u64, VersionChain>>,
    purged: AtomicU64,
    this: Weak<RecordTable>,
}

impl RecordTable {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|this| Self {
            name,
            rows: RwLock::new(BTreeMap::new()),
            purged: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 所有版本总数（包括不可见的）
    pub fn version_count(&self) -> usize {
        self.rows.read().values().map(VersionChain::len).sum()
    }

    pub fn chain(&self, key: u64) -> Option<VersionChain> {
        self.rows.read().get(&key).cloned()
    }

    /// 清扫累计清理的版本数
    pub fn purged(&self) -> u64 {
        self.purged.load(Ordering::Relaxed)
    }

    /// 写入新版本（`data` 为 None 时删除）
    ///
    /// 最新版本属于仍在运行的其他事务时等待它结束：
    /// 它提交后，快照事务报更新冲突，读已提交事务继续写入。
    pub fn write_version(
        &self,
        db: &DatabaseShared,
        tra: &mut Transaction,
        key: u64,
        data: Option<Vec<u8>>,
    ) -> TxResult<()> {
        tra.mark_write()?;
        let number = tra.number();
        if let Some(newest) = self.chain(key).and_then(|c| c.newest().cloned()) {
            self.check_update(db, tra, newest.writer)?;
        }

        self.rows.write().entry(key).or_default().push(RecordVersion {
            writer: number,
            data,
        });
        let table = self.this.clone();
        tra.post_undo(Box::new(move || -> TxResult<()> {
            if let Some(table) = table.upgrade() {
                let mut rows = table.rows.write();
                if let Some(chain) = rows.get_mut(&key) {
                    chain.undo_newest(number);
                    if chain.is_empty() {
                        rows.remove(&key);
                    }
                }
            }
            Ok(())
        }));
        trace!(table = %self.name, key, number, "record version written");
        Ok(())
    }

    fn check_update(&self, db: &DatabaseShared, tra: &Transaction, writer: TraNumber) -> TxResult<()> {
        let mut state = snapshot_state(db.tpc(), tra, writer)?;
        if state == TraState::Active {
            state = wait_for(db, tra.owner(), writer, tra.lock_wait())?;
            if state == TraState::Committed && !tra.is_read_committed() {
                return Err(TxError::UpdateConflict(writer));
            }
        }
        match state {
            TraState::Limbo => Err(TxError::RecordInLimbo(writer)),
            _ => Ok(()),
        }
    }

    /// 读取对事务可见的版本
    pub fn read_version(&self, db: &DatabaseShared, tra: &Transaction, key: u64) -> TxResult<Option<Vec<u8>>> {
        let Some(chain) = self.chain(key) else {
            return Ok(None);
        };
        let waits = matches!(
            tra.isolation(),
            IsolationMode::ReadCommitted(ReadCommittedMode::NoRecordVersion)
        );
        for version in chain.versions() {
            let mut state = snapshot_state(db.tpc(), tra, version.writer)?;
            if state == TraState::Active && waits {
                wait_for(db, tra.owner(), version.writer, tra.lock_wait())?;
                state = snapshot_state(db.tpc(), tra, version.writer)?;
            }
            match state {
                TraState::Us | TraState::Committed | TraState::Precommitted => {
                    return Ok(version.data.clone());
                }
                TraState::Limbo if !tra.flags().contains(TraFlags::IGNORE_LIMBO) => {
                    return Err(TxError::RecordInLimbo(version.writer));
                }
                _ => {}
            }
        }
        Ok(None)
    }

    /// 按键顺序返回所有可见记录
    pub fn scan_versions(&self, db: &DatabaseShared, tra: &Transaction) -> TxResult<Vec<(u64, Vec<u8>)>> {
        let keys: Vec<u64> = self.rows.read().keys().copied().collect();
        let mut rows = Vec::new();
        for key in keys {
            if let Some(data) = self.read_version(db, tra, key)? {
                rows.push((key, data));
            }
        }
        Ok(rows)
    }

    pub fn insert(&self, att: &mut Attachment, handle: TransactionHandle, key: u64, data: &[u8]) -> TxResult<()> {
        let db = att.database().clone();
        self.write_version(&db, att.transaction_mut(handle)?, key, Some(data.to_vec()))
    }

    pub fn delete(&self, att: &mut Attachment, handle: TransactionHandle, key: u64) -> TxResult<()> {
        let db = att.database().clone();
        self.write_version(&db, att.transaction_mut(handle)?, key, None)
    }

    pub fn get(&self, att: &Attachment, handle: TransactionHandle, key: u64) -> TxResult<Option<Vec<u8>>> {
        self.read_version(att.database(), att.transaction(handle)?, key)
    }

    pub fn scan(&self, att: &Attachment, handle: TransactionHandle) -> TxResult<Vec<(u64, Vec<u8>)>> {
        self.scan_versions(att.database(), att.transaction(handle)?)
    }
}

impl GarbageCollector for RecordTable {
    fn purge_dead(&self, number: TraNumber) -> TxResult<u64> {
        let mut rows = self.rows.write();
        let mut purged = 0u64;
        rows.retain(|_, chain| {
            purged += chain.purge(number) as u64;
            !chain.is_empty()
        });
        if purged > 0 {
            self.purged.fetch_add(purged, Ordering::Relaxed);
            debug!(table = %self.name, number, purged, "purged dead record versions");
        }
        Ok(purged)
    }
}

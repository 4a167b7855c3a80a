// 连接
//
// 连接独占它创建的事务控制块，对外只暴露稳定的事务句柄：
// 保留提交/回滚会替换事务号，但句柄不变。
// 连接被丢弃时回滚所有活动事务，已 prepare 的事务留在 limbo 中。

use crate::database::DatabaseShared;
use crate::error::{TxError, TxResult};
use crate::transactions::{
    self, parse_tpb, CommitOutcome, DeferredWork, ResourceRef, SavepointHandle, TraFlags, TraNumber,
    TraState, Transaction, TransactionOptions,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// 事务句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionHandle(u64);

impl fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tra#{}", self.0)
    }
}

/// 数据库连接
pub struct Attachment {
    id: u64,
    db: Arc<DatabaseShared>,
    transactions: BTreeMap<TransactionHandle, Transaction>,
    next_handle: u64,
}

impl Attachment {
    pub(crate) fn new(db: Arc<DatabaseShared>) -> Self {
        let id = db.next_attachment_id();
        debug!(attachment = id, "attachment opened");
        Self {
            id,
            db,
            transactions: BTreeMap::new(),
            next_handle: 1,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn database(&self) -> &Arc<DatabaseShared> {
        &self.db
    }

    /// 当前持有的事务句柄
    pub fn handles(&self) -> Vec<TransactionHandle> {
        self.transactions.keys().copied().collect()
    }

    fn register(&mut self, tra: Transaction) -> TransactionHandle {
        let handle = TransactionHandle(self.next_handle);
        self.next_handle += 1;
        self.transactions.insert(handle, tra);
        handle
    }

    pub fn transaction(&self, handle: TransactionHandle) -> TxResult<&Transaction> {
        self.transactions
            .get(&handle)
            .ok_or(TxError::InvalidHandle(handle.0))
    }

    pub fn transaction_mut(&mut self, handle: TransactionHandle) -> TxResult<&mut Transaction> {
        self.transactions
            .get_mut(&handle)
            .ok_or(TxError::InvalidHandle(handle.0))
    }

    /// 句柄当前对应的事务号
    pub fn number(&self, handle: TransactionHandle) -> TxResult<TraNumber> {
        self.transaction(handle).map(Transaction::number)
    }

    pub fn start(&mut self, options: &TransactionOptions) -> TxResult<TransactionHandle> {
        let tra = transactions::start(&self.db, options, None)?;
        Ok(self.register(tra))
    }

    /// 以二进制 TPB 开始事务
    pub fn start_tpb(&mut self, tpb: &[u8]) -> TxResult<TransactionHandle> {
        let options = parse_tpb(tpb)?;
        self.start(&options)
    }

    /// 自治事务：沿用外层事务的选项，独立提交
    pub fn start_autonomous(&mut self, outer: TransactionHandle) -> TxResult<TransactionHandle> {
        let (options, outer_number) = {
            let tra = self.transaction(outer)?;
            (tra.options().clone(), tra.number())
        };
        let tra = transactions::start(&self.db, &options, Some(outer_number))?;
        debug!(outer = outer_number, number = tra.number(), "autonomous transaction started");
        Ok(self.register(tra))
    }

    /// 根据结束结果更新句柄表
    fn settle(&mut self, handle: TransactionHandle, result: TxResult<CommitOutcome>) -> TxResult<()> {
        match result {
            Ok(CommitOutcome::Kept) => Ok(()),
            Ok(CommitOutcome::Released) => {
                self.transactions.remove(&handle);
                Ok(())
            }
            Ok(CommitOutcome::Retained(ticket)) => {
                if let Some(tra) = self.transactions.remove(&handle) {
                    self.transactions.insert(handle, tra.retain(ticket));
                }
                Ok(())
            }
            Err(err) => {
                if self
                    .transactions
                    .get(&handle)
                    .is_some_and(Transaction::is_released)
                {
                    self.transactions.remove(&handle);
                }
                Err(err)
            }
        }
    }

    fn end(
        &mut self,
        handle: TransactionHandle,
        f: impl FnOnce(&DatabaseShared, &mut Transaction) -> TxResult<CommitOutcome>,
    ) -> TxResult<()> {
        let db = self.db.clone();
        let tra = self
            .transactions
            .get_mut(&handle)
            .ok_or(TxError::InvalidHandle(handle.0))?;
        let result = f(&db, tra);
        self.settle(handle, result)
    }

    pub fn commit(&mut self, handle: TransactionHandle) -> TxResult<()> {
        self.end(handle, |db, tra| transactions::commit(db, tra, false))
    }

    pub fn commit_retaining(&mut self, handle: TransactionHandle) -> TxResult<()> {
        self.end(handle, |db, tra| transactions::commit(db, tra, true))
    }

    pub fn rollback(&mut self, handle: TransactionHandle) -> TxResult<()> {
        self.end(handle, |db, tra| transactions::rollback(db, tra, false, false))
    }

    pub fn rollback_retaining(&mut self, handle: TransactionHandle) -> TxResult<()> {
        self.end(handle, |db, tra| transactions::rollback(db, tra, true, false))
    }

    /// 不执行撤销，直接丢弃全部修改并置为 Dead
    pub fn force_rollback(&mut self, handle: TransactionHandle) -> TxResult<()> {
        self.end(handle, |db, tra| transactions::rollback(db, tra, false, true))
    }

    pub fn prepare(&mut self, handle: TransactionHandle, description: Option<&[u8]>) -> TxResult<()> {
        let db = self.db.clone();
        let tra = self.transaction_mut(handle)?;
        transactions::prepare(&db, tra, description)
    }

    /// 接管一个 limbo 事务，之后可以提交或回滚它
    pub fn reconnect(&mut self, number: TraNumber) -> TxResult<TransactionHandle> {
        let tra = transactions::reconnect(&self.db, number)?;
        Ok(self.register(tra))
    }

    /// 读事务眼中写事务的状态
    pub fn is_visible(&self, reader: TransactionHandle, writer: TraNumber) -> TxResult<TraState> {
        let tra = self.transaction(reader)?;
        transactions::snapshot_state(self.db.tpc(), tra, writer)
    }

    /// 等待写事务结束，使用读事务的锁等待方式
    pub fn wait_for(&self, handle: TransactionHandle, writer: TraNumber) -> TxResult<TraState> {
        let tra = self.transaction(handle)?;
        transactions::wait_for(&self.db, tra.owner(), writer, tra.lock_wait())
    }

    pub fn post_resource(&mut self, handle: TransactionHandle, resource: ResourceRef) -> TxResult<()> {
        let db = self.db.clone();
        let tra = self.transaction_mut(handle)?;
        transactions::post_resource(&db, tra, resource)
    }

    pub fn defer_work(&mut self, handle: TransactionHandle, work: Box<dyn DeferredWork>) -> TxResult<()> {
        self.transaction_mut(handle)?.defer_work(work);
        Ok(())
    }

    pub fn start_request(&mut self, handle: TransactionHandle) -> TxResult<()> {
        let db = self.db.clone();
        let tra = self.transaction_mut(handle)?;
        transactions::start_request(&db, tra)
    }

    /// 语句结束；自动提交事务回到最外层且有修改时执行保留提交
    pub fn finish_request(&mut self, handle: TransactionHandle) -> TxResult<()> {
        let db = self.db.clone();
        let tra = self.transaction_mut(handle)?;
        let outermost = transactions::finish_request(&db, tra);
        if outermost && tra.flags().contains(TraFlags::AUTOCOMMIT) && tra.wrote() {
            debug!(number = tra.number(), "autocommit");
            return self.commit_retaining(handle);
        }
        Ok(())
    }

    pub fn savepoint(&mut self, handle: TransactionHandle, name: Option<&str>) -> TxResult<SavepointHandle> {
        Ok(self.transaction_mut(handle)?.start_savepoint(name))
    }

    pub fn rollback_savepoint(&mut self, handle: TransactionHandle, savepoint: SavepointHandle) -> TxResult<()> {
        self.transaction_mut(handle)?.rollback_savepoint(savepoint)
    }

    pub fn release_savepoint(&mut self, handle: TransactionHandle, savepoint: SavepointHandle) -> TxResult<()> {
        self.transaction_mut(handle)?.release_savepoint(savepoint)
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        let db = self.db.clone();
        for (handle, mut tra) in std::mem::take(&mut self.transactions) {
            if tra.is_prepared() {
                // limbo 事务由之后的 reconnect 解决
                debug!(%handle, number = tra.number(), "leaving prepared transaction in limbo");
                transactions::release(&db, &mut tra);
                continue;
            }
            if let Err(err) = transactions::rollback(&db, &mut tra, false, false) {
                warn!(%handle, number = tra.number(), error = %err, "rollback on detach failed");
                transactions::release(&db, &mut tra);
            }
        }
        debug!(attachment = self.id, "attachment closed");
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("id", &self.id)
            .field("transactions", &self.transactions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::database::Database;

    fn setup() -> Database {
        Database::create_in_memory(EngineConfig::small_pages(64).with_sweep_interval(0)).unwrap()
    }

    #[test]
    fn test_handle_survives_retain() {
        let db = setup();
        let mut att = db.attach().unwrap();
        let h = att.start(&TransactionOptions::default()).unwrap();
        let first = att.number(h).unwrap();
        att.transaction_mut(h).unwrap().mark_write().unwrap();
        att.commit_retaining(h).unwrap();
        let second = att.number(h).unwrap();
        assert!(second > first);
        assert_eq!(db.transaction_state(first).unwrap(), TraState::Committed);
        assert_eq!(att.is_visible(h, first).unwrap(), TraState::Committed);
        att.commit(h).unwrap();
        assert!(matches!(att.number(h), Err(TxError::InvalidHandle(_))));
    }

    #[test]
    fn test_drop_rolls_back_active() {
        let db = setup();
        let number = {
            let mut att = db.attach().unwrap();
            let h = att.start(&TransactionOptions::default()).unwrap();
            att.transaction_mut(h).unwrap().mark_write().unwrap();
            att.number(h).unwrap()
        };
        assert_eq!(db.transaction_state(number).unwrap(), TraState::Dead);
        assert_eq!(db.shared().live_transactions(), 0);
    }

    #[test]
    fn test_drop_leaves_limbo() {
        let db = setup();
        let number = {
            let mut att = db.attach().unwrap();
            let h = att.start(&TransactionOptions::default()).unwrap();
            att.prepare(h, Some(b"xid-1")).unwrap();
            att.number(h).unwrap()
        };
        assert_eq!(db.transaction_state(number).unwrap(), TraState::Limbo);
        assert_eq!(db.limbo_transactions().unwrap(), vec![number]);
    }

    #[test]
    fn test_autonomous_inherits_options() {
        let db = setup();
        let mut att = db.attach().unwrap();
        let outer = att
            .start(&TransactionOptions::read_committed(crate::transactions::ReadCommittedMode::RecordVersion).no_wait())
            .unwrap();
        let inner = att.start_autonomous(outer).unwrap();
        let outer_number = att.number(outer).unwrap();
        let tra = att.transaction(inner).unwrap();
        assert_eq!(tra.outer(), Some(outer_number));
        assert!(tra.is_read_committed());
        att.commit(inner).unwrap();
        att.rollback(outer).unwrap();
    }

    #[test]
    fn test_autocommit_on_finish_request() {
        let db = setup();
        let mut att = db.attach().unwrap();
        let h = att
            .start(&TransactionOptions::default().autocommit())
            .unwrap();
        let first = att.number(h).unwrap();
        att.start_request(h).unwrap();
        att.transaction_mut(h).unwrap().mark_write().unwrap();
        att.finish_request(h).unwrap();
        assert_eq!(db.transaction_state(first).unwrap(), TraState::Committed);
        assert!(att.number(h).unwrap() > first);

        // 没有修改的语句不提交
        let second = att.number(h).unwrap();
        att.start_request(h).unwrap();
        att.finish_request(h).unwrap();
        assert_eq!(att.number(h).unwrap(), second);
    }
}

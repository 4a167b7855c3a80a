// 基于锁的事务存活检测
//
// 每个活动事务持有以其事务号为键的排他锁，锁数据为它计算出的 oldest-active。
// 能以共享模式非阻塞地拿到该锁，说明事务已经结束。

use super::TraNumber;
use crate::error::TxResult;
use crate::lock::{LockClass, LockId, LockKey, LockLevel, LockManager, LockOwner, LockQuery, LockWait};
use std::sync::Arc;
use tracing::trace;

/// 事务存活锁跟踪器
pub struct TraLockTracker {
    locks: Arc<LockManager>,
    query_owner: LockOwner,
}

impl TraLockTracker {
    pub fn new(locks: Arc<LockManager>) -> Self {
        let query_owner = locks.new_owner();
        Self { locks, query_owner }
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// 为新事务获取存活锁并写入锁数据
    pub fn acquire(&self, owner: LockOwner, number: TraNumber, oldest_active: TraNumber) -> TxResult<LockId> {
        self.locks.lock_with_data(
            owner,
            LockKey::transaction(number),
            LockLevel::Exclusive,
            LockWait::NoWait,
            oldest_active as i64,
        )
    }

    /// 更新事务公布的 oldest-active
    pub fn publish(&self, lock: LockId, oldest_active: TraNumber) {
        self.locks.write_data(lock, oldest_active as i64);
    }

    pub fn payload(&self, lock: LockId) -> Option<TraNumber> {
        self.locks.read_data(lock).map(|v| v as TraNumber)
    }

    /// 事务是否（可能）仍在运行；任何获取失败都视为仍在运行
    pub fn is_active(&self, number: TraNumber) -> bool {
        match self.locks.lock(
            self.query_owner,
            LockKey::transaction(number),
            LockLevel::SharedRead,
            LockWait::NoWait,
        ) {
            Ok(id) => {
                self.locks.release(id);
                false
            }
            Err(_) => {
                trace!(number, "transaction lock is held");
                true
            }
        }
    }

    /// 等待事务结束，阻塞失败（超时、死锁）向上传播
    pub fn wait(&self, owner: LockOwner, number: TraNumber, wait: LockWait) -> TxResult<()> {
        let id = self.locks.lock(
            owner,
            LockKey::transaction(number),
            LockLevel::SharedRead,
            wait,
        )?;
        self.locks.release(id);
        Ok(())
    }

    /// 所有活动事务公布的最小 oldest-active
    pub fn query_oldest_active(&self, except: Option<LockId>) -> Option<TraNumber> {
        self.locks
            .query_data(LockClass::Transaction, LockQuery::Min, except)
            .map(|v| v as TraNumber)
    }

    pub fn release(&self, lock: LockId) {
        self.locks.release(lock);
    }
}

// 锁管理模块
//
// 进程内的分级键控锁表：
// - 六级锁模式及其兼容矩阵
// - 阻塞 / 非阻塞 / 超时获取，锁转换
// - 每个锁请求携带一个 i64 数据，可按锁类聚合查询
// - 等待图死锁检测

pub mod deadlock;

pub use deadlock::{DeadlockDetector, DeadlockInfo, DeadlockStats, WaitGraph};

use crate::error::{TxError, TxResult};
use crate::transactions::ResourceKind;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// 锁所有者（事务、清扫线程、探测者）
pub type LockOwner = u64;

/// 已授予的锁请求
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(u64);

/// 锁模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockLevel {
    Null,
    SharedRead,
    ProtectedRead,
    SharedWrite,
    ProtectedWrite,
    Exclusive,
}

impl LockLevel {
    /// 两个模式能否同时被不同所有者持有
    pub fn compatible(self, other: LockLevel) -> bool {
        use LockLevel::*;
        match (self, other) {
            (Null, _) | (_, Null) => true,
            (Exclusive, _) | (_, Exclusive) => false,
            (SharedRead, _) | (_, SharedRead) => true,
            (ProtectedRead, ProtectedRead) => true,
            (SharedWrite, SharedWrite) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockLevel::Null => "NULL",
            LockLevel::SharedRead => "SR",
            LockLevel::ProtectedRead => "PR",
            LockLevel::SharedWrite => "SW",
            LockLevel::ProtectedWrite => "PW",
            LockLevel::Exclusive => "EX",
        };
        f.write_str(name)
    }
}

/// 锁类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockClass {
    /// 事务存活锁，数据为该事务的 oldest-active
    Transaction,
    /// 关系预留
    Relation,
    /// 对象存在锁，防止并发删除
    Existence(ResourceKind),
    /// 清扫互斥
    Sweep,
}

/// 锁键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub class: LockClass,
    pub id: u64,
}

impl LockKey {
    pub fn transaction(number: u64) -> Self {
        Self {
            class: LockClass::Transaction,
            id: number,
        }
    }

    pub fn relation(id: u64) -> Self {
        Self {
            class: LockClass::Relation,
            id,
        }
    }

    pub fn existence(kind: ResourceKind, id: u64) -> Self {
        Self {
            class: LockClass::Existence(kind),
            id,
        }
    }

    pub fn sweep() -> Self {
        Self {
            class: LockClass::Sweep,
            id: 0,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class {
            LockClass::Transaction => write!(f, "transaction {}", self.id),
            LockClass::Relation => write!(f, "relation {}", self.id),
            LockClass::Existence(kind) => write!(f, "{} {}", kind, self.id),
            LockClass::Sweep => write!(f, "sweep"),
        }
    }
}

/// 等待方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    NoWait,
    Wait,
    Timeout(Duration),
}

/// 锁数据聚合方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockQuery {
    Min,
    Max,
    Count,
    Any,
}

#[derive(Debug, Clone)]
struct Request {
    key: LockKey,
    owner: LockOwner,
    level: LockLevel,
    /// 未写入数据的请求不参与聚合查询
    data: Option<i64>,
}

#[derive(Debug, Default)]
struct LockTable {
    requests: HashMap<LockId, Request>,
    granted: HashMap<LockKey, Vec<LockId>>,
    detector: DeadlockDetector,
}

impl LockTable {
    /// 与请求冲突的其他所有者
    fn blockers(
        &self,
        key: &LockKey,
        owner: LockOwner,
        level: LockLevel,
        except: Option<LockId>,
    ) -> Vec<LockOwner> {
        let mut owners = Vec::new();
        if let Some(ids) = self.granted.get(key) {
            for id in ids {
                if Some(*id) == except {
                    continue;
                }
                if let Some(req) = self.requests.get(id) {
                    if req.owner != owner && !level.compatible(req.level) && !owners.contains(&req.owner) {
                        owners.push(req.owner);
                    }
                }
            }
        }
        owners
    }
}

/// 锁统计
#[derive(Debug, Default)]
struct LockCounters {
    requests: AtomicU64,
    grants: AtomicU64,
    conflicts: AtomicU64,
    waits: AtomicU64,
    timeouts: AtomicU64,
    deadlocks: AtomicU64,
    releases: AtomicU64,
}

/// 锁统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    pub requests: u64,
    pub grants: u64,
    /// 非阻塞请求失败次数
    pub conflicts: u64,
    pub waits: u64,
    pub timeouts: u64,
    pub deadlocks: u64,
    pub releases: u64,
    /// 当前持有的锁数
    pub held: usize,
}

/// 锁管理器
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    next_id: AtomicU64,
    next_owner: AtomicU64,
    deadlock_detection: bool,
    counters: LockCounters,
}

impl LockManager {
    pub fn new(deadlock_detection: bool) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            next_id: AtomicU64::new(1),
            next_owner: AtomicU64::new(1),
            deadlock_detection,
            counters: LockCounters::default(),
        }
    }

    /// 分配新的锁所有者
    pub fn new_owner(&self) -> LockOwner {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    fn wait_compatible(
        &self,
        table: &mut MutexGuard<'_, LockTable>,
        owner: LockOwner,
        key: LockKey,
        level: LockLevel,
        except: Option<LockId>,
        wait: LockWait,
    ) -> TxResult<()> {
        let deadline = match wait {
            LockWait::Timeout(timeout) => Some(Instant::now() + timeout),
            _ => None,
        };
        let mut waited = false;

        loop {
            let blockers = table.blockers(&key, owner, level, except);
            if blockers.is_empty() {
                if waited {
                    table.detector.on_wait_end(owner);
                }
                return Ok(());
            }
            if wait == LockWait::NoWait {
                self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                return Err(TxError::LockConflict(key.to_string()));
            }
            if !waited {
                waited = true;
                self.counters.waits.fetch_add(1, Ordering::Relaxed);
                trace!(owner, %key, %level, "waiting for lock");
            }

            if self.deadlock_detection {
                if let Some(info) = table.detector.on_wait(owner, blockers) {
                    table.detector.on_wait_end(owner);
                    self.counters.deadlocks.fetch_add(1, Ordering::Relaxed);
                    warn!(owner, %key, cycle = ?info.involved_owners, "deadlock detected");
                    return Err(TxError::Deadlock(key.to_string()));
                }
            }

            match deadline {
                Some(deadline) => {
                    let timed_out = self.released.wait_until(table, deadline).timed_out();
                    if timed_out && !table.blockers(&key, owner, level, except).is_empty() {
                        table.detector.on_wait_end(owner);
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        return Err(TxError::LockTimeout(key.to_string()));
                    }
                }
                None => self.released.wait(table),
            }
        }
    }

    /// 获取锁
    pub fn lock(
        &self,
        owner: LockOwner,
        key: LockKey,
        level: LockLevel,
        wait: LockWait,
    ) -> TxResult<LockId> {
        self.grant(owner, key, level, wait, None)
    }

    /// 获取锁并在授予的同时写入锁数据
    pub fn lock_with_data(
        &self,
        owner: LockOwner,
        key: LockKey,
        level: LockLevel,
        wait: LockWait,
        data: i64,
    ) -> TxResult<LockId> {
        self.grant(owner, key, level, wait, Some(data))
    }

    fn grant(
        &self,
        owner: LockOwner,
        key: LockKey,
        level: LockLevel,
        wait: LockWait,
        data: Option<i64>,
    ) -> TxResult<LockId> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let mut table = self.table.lock();
        self.wait_compatible(&mut table, owner, key, level, None, wait)?;

        let id = LockId(self.next_id.fetch_add(1, Ordering::Relaxed));
        table.requests.insert(
            id,
            Request {
                key,
                owner,
                level,
                data,
            },
        );
        table.granted.entry(key).or_default().push(id);
        self.counters.grants.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// 释放锁，返回锁是否存在
    pub fn release(&self, id: LockId) -> bool {
        let mut table = self.table.lock();
        let Some(req) = table.requests.remove(&id) else {
            return false;
        };
        if let Some(ids) = table.granted.get_mut(&req.key) {
            ids.retain(|g| *g != id);
            if ids.is_empty() {
                table.granted.remove(&req.key);
            }
        }
        drop(table);
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        self.released.notify_all();
        true
    }

    /// 转换锁模式
    pub fn convert(&self, id: LockId, level: LockLevel, wait: LockWait) -> TxResult<()> {
        let mut table = self.table.lock();
        let (key, owner) = match table.requests.get(&id) {
            Some(req) => (req.key, req.owner),
            None => return Err(TxError::consistency(format!("lock {:?} is not held", id))),
        };
        self.wait_compatible(&mut table, owner, key, level, Some(id), wait)?;
        if let Some(req) = table.requests.get_mut(&id) {
            req.level = level;
        }
        drop(table);
        // 降级可能唤醒等待者
        self.released.notify_all();
        Ok(())
    }

    pub fn read_data(&self, id: LockId) -> Option<i64> {
        self.table.lock().requests.get(&id).and_then(|r| r.data)
    }

    pub fn write_data(&self, id: LockId, data: i64) -> bool {
        match self.table.lock().requests.get_mut(&id) {
            Some(req) => {
                req.data = Some(data);
                true
            }
            None => false,
        }
    }

    pub fn level(&self, id: LockId) -> Option<LockLevel> {
        self.table.lock().requests.get(&id).map(|r| r.level)
    }

    /// 对某一锁类的所有锁数据做聚合，可排除一个锁
    pub fn query_data(&self, class: LockClass, query: LockQuery, except: Option<LockId>) -> Option<i64> {
        let table = self.table.lock();
        let mut values = table
            .requests
            .iter()
            .filter(|(id, req)| req.key.class == class && Some(**id) != except)
            .filter_map(|(_, req)| req.data);
        match query {
            LockQuery::Min => values.min(),
            LockQuery::Max => values.max(),
            LockQuery::Count => Some(values.count() as i64),
            LockQuery::Any => values.next(),
        }
    }

    /// 当前持有某个键的锁数量
    pub fn holders(&self, key: &LockKey) -> usize {
        self.table.lock().granted.get(key).map_or(0, |ids| ids.len())
    }

    pub fn deadlock_history(&self) -> Vec<DeadlockInfo> {
        self.table.lock().detector.history()
    }

    pub fn deadlock_stats(&self) -> DeadlockStats {
        self.table.lock().detector.stats()
    }

    pub fn stats(&self) -> LockStats {
        let held = self.table.lock().requests.len();
        LockStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            grants: self.counters.grants.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            deadlocks: self.counters.deadlocks.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
            held,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_compatibility_matrix() {
        use LockLevel::*;
        let levels = [Null, SharedRead, ProtectedRead, SharedWrite, ProtectedWrite, Exclusive];
        let expected = [
            [true, true, true, true, true, true],
            [true, true, true, true, true, false],
            [true, true, true, false, false, false],
            [true, true, false, true, false, false],
            [true, true, false, false, false, false],
            [true, false, false, false, false, false],
        ];
        for (i, a) in levels.iter().enumerate() {
            for (j, b) in levels.iter().enumerate() {
                assert_eq!(a.compatible(*b), expected[i][j], "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn test_nowait_conflict() {
        let lm = LockManager::new(true);
        let (a, b) = (lm.new_owner(), lm.new_owner());
        let key = LockKey::transaction(10);
        let id = lm.lock(a, key, LockLevel::Exclusive, LockWait::NoWait).unwrap();
        let err = lm.lock(b, key, LockLevel::SharedRead, LockWait::NoWait).unwrap_err();
        assert!(err.is_retryable());
        // 同一所有者不冲突
        lm.lock(a, key, LockLevel::SharedRead, LockWait::NoWait).unwrap();
        assert!(lm.release(id));
        assert!(!lm.release(id));
        assert_eq!(lm.stats().conflicts, 1);
    }

    #[test]
    fn test_timeout() {
        let lm = LockManager::new(true);
        let (a, b) = (lm.new_owner(), lm.new_owner());
        let key = LockKey::relation(1);
        lm.lock(a, key, LockLevel::ProtectedWrite, LockWait::NoWait).unwrap();
        let err = lm
            .lock(b, key, LockLevel::ProtectedRead, LockWait::Timeout(Duration::from_millis(30)))
            .unwrap_err();
        assert!(matches!(err, TxError::LockTimeout(_)));
        assert_eq!(lm.stats().timeouts, 1);
    }

    #[test]
    fn test_wait_until_released() {
        let lm = Arc::new(LockManager::new(true));
        let (a, b) = (lm.new_owner(), lm.new_owner());
        let key = LockKey::transaction(3);
        let id = lm.lock(a, key, LockLevel::Exclusive, LockWait::NoWait).unwrap();

        let waiter = {
            let lm = lm.clone();
            thread::spawn(move || lm.lock(b, key, LockLevel::SharedRead, LockWait::Wait))
        };
        thread::sleep(Duration::from_millis(20));
        lm.release(id);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_deadlock_detected() {
        let lm = Arc::new(LockManager::new(true));
        let (a, b) = (lm.new_owner(), lm.new_owner());
        let k1 = LockKey::relation(1);
        let k2 = LockKey::relation(2);
        lm.lock(a, k1, LockLevel::Exclusive, LockWait::NoWait).unwrap();
        lm.lock(b, k2, LockLevel::Exclusive, LockWait::NoWait).unwrap();

        let first = {
            let lm = lm.clone();
            thread::spawn(move || lm.lock(a, k2, LockLevel::Exclusive, LockWait::Timeout(Duration::from_secs(2))))
        };
        thread::sleep(Duration::from_millis(50));
        let second = lm.lock(b, k1, LockLevel::Exclusive, LockWait::Wait);
        assert!(matches!(second, Err(TxError::Deadlock(_))));
        // 受害者放弃后另一方仍在等待，直到超时
        assert!(first.join().unwrap().is_err());
        assert_eq!(lm.stats().deadlocks, 1);
        assert_eq!(lm.deadlock_history().len(), 1);
    }

    #[test]
    fn test_convert() {
        let lm = LockManager::new(true);
        let (a, b) = (lm.new_owner(), lm.new_owner());
        let key = LockKey::relation(7);
        let mine = lm.lock(a, key, LockLevel::SharedRead, LockWait::NoWait).unwrap();
        lm.lock(b, key, LockLevel::SharedRead, LockWait::NoWait).unwrap();
        assert!(lm.convert(mine, LockLevel::Exclusive, LockWait::NoWait).is_err());
        lm.convert(mine, LockLevel::ProtectedRead, LockWait::NoWait).unwrap();
        assert_eq!(lm.level(mine), Some(LockLevel::ProtectedRead));
    }

    #[test]
    fn test_query_data() {
        let lm = LockManager::new(false);
        let owner = lm.new_owner();
        let mut ids = Vec::new();
        for (n, data) in [(5u64, 3i64), (6, 1), (7, 9)] {
            let id = lm.lock(owner, LockKey::transaction(n), LockLevel::Exclusive, LockWait::NoWait).unwrap();
            lm.write_data(id, data);
            ids.push(id);
        }
        lm.lock(owner, LockKey::relation(1), LockLevel::SharedRead, LockWait::NoWait).unwrap();
        // 没有数据的请求不参与聚合
        let reader = lm.new_owner();
        let reader_id = lm.lock(reader, LockKey::transaction(2), LockLevel::SharedRead, LockWait::NoWait).unwrap();
        assert_eq!(lm.read_data(reader_id), None);
        let seeded = lm
            .lock_with_data(reader, LockKey::transaction(8), LockLevel::Exclusive, LockWait::NoWait, 4)
            .unwrap();
        assert_eq!(lm.read_data(seeded), Some(4));
        lm.release(seeded);

        assert_eq!(lm.query_data(LockClass::Transaction, LockQuery::Min, None), Some(1));
        assert_eq!(lm.query_data(LockClass::Transaction, LockQuery::Max, None), Some(9));
        assert_eq!(lm.query_data(LockClass::Transaction, LockQuery::Count, None), Some(3));
        assert_eq!(lm.query_data(LockClass::Transaction, LockQuery::Min, Some(ids[1])), Some(3));
        assert_eq!(lm.query_data(LockClass::Sweep, LockQuery::Min, None), None);
        assert_eq!(lm.read_data(ids[2]), Some(9));
    }
}

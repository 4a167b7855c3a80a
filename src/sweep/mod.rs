// 清扫
//
// 遍历 [OIT, OAT) 区间：
// - Dead 事务交给垃圾回收器清理其记录版本，未注册回收器时在此停止
// - 没有锁持有者的 Active 事务（崩溃遗留）先置为 Dead 再清理
// - 遇到 limbo 或仍在运行的事务时停止
// 完成后把 OIT 推进到停止位置，并释放其下的状态缓存块。

pub mod scheduler;

pub use scheduler::SweepScheduler;

use crate::database::DatabaseShared;
use crate::error::{TxError, TxResult};
use crate::lock::{LockKey, LockLevel, LockWait};
use crate::tpc::StateMask;
use crate::transactions::lifecycle::resolve_orphan;
use crate::transactions::{TraNumber, TraState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 垃圾回收器：清理某个已死事务留下的记录版本
pub trait GarbageCollector: Send + Sync {
    /// 返回清理掉的版本数
    fn purge_dead(&self, number: TraNumber) -> TxResult<u64>;
}

/// 协作式取消令牌
#[derive(Debug, Clone, Default)]
pub struct SweepCheckpoint {
    cancelled: Arc<AtomicBool>,
}

impl SweepCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// 检查点：已取消时返回错误
    pub fn check(&self) -> TxResult<()> {
        if self.is_cancelled() {
            return Err(TxError::Cancelled("sweep".into()));
        }
        Ok(())
    }
}

/// 清扫报告
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub oit_before: TraNumber,
    pub oit_after: TraNumber,
    pub oldest_active: TraNumber,
    /// 访问过的事务号数
    pub visited: u64,
    pub dead_transactions: u64,
    /// 崩溃遗留并被置为 Dead 的事务数
    pub orphans_resolved: u64,
    pub versions_purged: u64,
    /// 停止位置及其状态
    pub stopped_at: Option<(TraNumber, TraState)>,
    pub released_blocks: usize,
    pub elapsed_ms: u64,
}

/// 自动清扫触发器
pub struct SweepTrigger {
    interval: u64,
    sender: Mutex<Option<mpsc::Sender<()>>>,
    requests: AtomicU64,
}

impl SweepTrigger {
    /// `interval` 为 0 时不自动清扫
    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            sender: Mutex::new(None),
            requests: AtomicU64::new(0),
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub(crate) fn attach(&self, sender: mpsc::Sender<()>) {
        *self.sender.lock() = Some(sender);
    }

    pub(crate) fn detach(&self) {
        self.sender.lock().take();
    }

    /// OIT 与 oldest-active 的差距是否超过清扫间隔
    pub fn should_sweep(&self, oit: TraNumber, oldest_active: TraNumber) -> bool {
        self.interval > 0 && oldest_active.saturating_sub(oit) > self.interval
    }

    /// 请求一次后台清扫；已有待处理请求时合并，返回是否已投递
    pub fn request(&self) -> bool {
        self.requests.fetch_add(1, Ordering::Relaxed);
        match self.sender.lock().as_ref() {
            Some(sender) => sender.try_send(()).is_ok(),
            None => false,
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

/// 执行一次清扫；已有清扫在运行时返回 None
pub fn run_sweep(db: &DatabaseShared, checkpoint: &SweepCheckpoint) -> TxResult<Option<SweepReport>> {
    let locks = db.locks();
    let owner = locks.new_owner();
    let sweep_lock = match locks.lock(owner, LockKey::sweep(), LockLevel::Exclusive, LockWait::NoWait) {
        Ok(lock) => lock,
        Err(err) if err.is_retryable() => {
            debug!("another sweep is running");
            return Ok(None);
        }
        Err(err) => return Err(err),
    };
    let result = sweep_range(db, checkpoint);
    locks.release(sweep_lock);
    result.map(Some)
}

fn sweep_range(db: &DatabaseShared, checkpoint: &SweepCheckpoint) -> TxResult<SweepReport> {
    let started = Instant::now();
    let tpc = db.tpc();
    let header = db.watermarks().read_snapshot();
    let collector = db.garbage_collector();
    let check_every = db.config().sweep_checkpoint_interval.max(1);

    let mut report = SweepReport {
        oit_before: header.oit,
        oit_after: header.oit,
        oldest_active: header.oat,
        ..SweepReport::default()
    };
    info!(oit = header.oit, oat = header.oat, "sweep started");
    checkpoint.check()?;

    let mut new_oit = header.oat;
    let mut cursor = header.oit;
    let mut since_check = 0u64;
    while cursor < header.oat {
        let next = tpc.find_first_in_range(
            cursor,
            header.oat,
            StateMask::ACTIVE | StateMask::LIMBO | StateMask::DEAD,
        )?;
        let Some(candidate) = next else {
            report.visited += header.oat - cursor;
            break;
        };
        report.visited += candidate - cursor + 1;
        since_check += candidate - cursor + 1;
        if since_check >= check_every {
            checkpoint.check()?;
            since_check = 0;
        }

        let state = match tpc.cache_state(candidate)? {
            TraState::Active => {
                let resolved = resolve_orphan(db, candidate)?;
                if resolved == TraState::Dead {
                    report.orphans_resolved += 1;
                }
                resolved
            }
            other => other,
        };
        match state {
            TraState::Dead => match &collector {
                Some(collector) => {
                    report.dead_transactions += 1;
                    report.versions_purged += collector.purge_dead(candidate)?;
                }
                None => {
                    // 没有回收器时已死版本仍在，OIT 不能越过
                    debug!(
                        id = candidate,
                        "no garbage collector, sweep stops at dead transaction"
                    );
                    new_oit = candidate;
                    report.stopped_at = Some((candidate, state));
                    break;
                }
            },
            TraState::Active | TraState::Limbo => {
                new_oit = candidate;
                report.stopped_at = Some((candidate, state));
                break;
            }
            _ => {}
        }
        cursor = candidate + 1;
    }

    let merged = db.watermarks().advance(Some(new_oit), None, None)?;
    report.oit_after = merged.oit;
    report.released_blocks = tpc.update_oldest(merged.oit);
    if let Err(err) = db.watermarks().flush() {
        warn!(error = %err, "failed to persist watermarks after sweep");
        return Err(err);
    }
    report.elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        oit_before = report.oit_before,
        oit_after = report.oit_after,
        dead = report.dead_transactions,
        purged = report.versions_purged,
        elapsed_ms = report.elapsed_ms,
        "sweep finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_cancel() {
        let checkpoint = SweepCheckpoint::new();
        assert!(checkpoint.check().is_ok());
        let shared = checkpoint.clone();
        shared.cancel();
        assert!(checkpoint.is_cancelled());
        assert!(matches!(checkpoint.check(), Err(TxError::Cancelled(_))));
    }

    #[test]
    fn test_trigger_threshold() {
        let trigger = SweepTrigger::new(100);
        assert!(!trigger.should_sweep(10, 110));
        assert!(trigger.should_sweep(10, 111));
        assert!(!SweepTrigger::new(0).should_sweep(1, 1_000_000));
    }

    #[test]
    fn test_request_coalesces() {
        let trigger = SweepTrigger::new(1);
        assert!(!trigger.request());
        let (tx, mut rx) = mpsc::channel(1);
        trigger.attach(tx);
        assert!(trigger.request());
        assert!(!trigger.request());
        assert_eq!(rx.try_recv(), Ok(()));
        assert_eq!(trigger.requests(), 3);
        trigger.detach();
        assert!(!trigger.request());
    }
}

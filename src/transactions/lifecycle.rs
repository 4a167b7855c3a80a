// 事务生命周期
//
// start / commit / rollback / prepare / reconnect 以及保留上下文。
// 所有操作显式接收数据库共享状态（水位线、TIP、状态缓存、锁管理器），
// 不依赖任何全局变量。

use super::reservation::expand_reservations;
use super::resources::ResourceRef;
use super::transaction::{CommitOutcome, RetainTicket, Snapshot, Transaction};
use super::{IsolationMode, ReadCommittedMode, TraFlags, TraNumber, TraState, TransactionOptions};
use crate::database::{limbo_key, DatabaseShared};
use crate::error::{TxError, TxResult};
use crate::lock::{LockKey, LockLevel, LockOwner, LockWait};
use crate::storage::FlushScope;
use crate::tip::WriteHint;
use crate::tpc::StateMask;
use tracing::{debug, trace, warn};

fn resolve_isolation(db: &DatabaseShared, isolation: IsolationMode) -> IsolationMode {
    match isolation {
        IsolationMode::ReadCommitted(_) if db.config().read_consistency => {
            IsolationMode::ReadCommitted(ReadCommittedMode::ReadConsistency)
        }
        other => other,
    }
}

fn initial_flags(options: &TransactionOptions) -> TraFlags {
    let mut flags = TraFlags::empty();
    flags.set(TraFlags::READ_ONLY, options.is_read_only());
    flags.set(TraFlags::AUTOCOMMIT, options.autocommit);
    flags.set(TraFlags::NO_AUTO_UNDO, options.no_auto_undo);
    flags.set(TraFlags::IGNORE_LIMBO, options.ignore_limbo);
    flags.set(TraFlags::RESTART_REQUESTS, options.restart_requests);
    flags
}

/// 仍为 Active 且没有锁持有者的事务必然已崩溃，强制置为 Dead
pub(crate) fn resolve_orphan(db: &DatabaseShared, number: TraNumber) -> TxResult<TraState> {
    let state = db.tpc().cache_state(number)?;
    if state != TraState::Active || db.tracker().is_active(number) {
        return Ok(state);
    }
    // 存活锁已释放，状态必须重新读取
    let state = db.tpc().cache_state(number)?;
    if state == TraState::Active {
        warn!(number, "transaction lock has no holder, marking dead");
        db.tpc().set_state(number, TraState::Dead, WriteHint::NoFlush)?;
        return Ok(TraState::Dead);
    }
    Ok(state)
}

/// 开始事务
pub fn start(
    db: &DatabaseShared,
    options: &TransactionOptions,
    outer: Option<TraNumber>,
) -> TxResult<Transaction> {
    db.check_open()?;
    options.validate()?;
    let isolation = resolve_isolation(db, options.isolation);
    let catalog = db.catalog();
    let reservations = expand_reservations(catalog.as_ref(), &options.reservations, isolation)?;
    let lock_wait = options.lock_wait(db.config().lock_timeout());

    let owner = db.locks().new_owner();
    let tracker = db.tracker();
    let placeholder = db.watermarks().oldest_active();
    let (number, lock) = db
        .watermarks()
        .allocate_next(db.tip(), |n| tracker.acquire(owner, n, placeholder))?;

    let snapshot = Snapshot {
        oldest: number,
        oldest_active: number,
        number: 0,
    };
    let mut tra = Transaction::new(
        number,
        isolation,
        options.clone(),
        initial_flags(options),
        lock_wait,
        owner,
        lock,
        snapshot,
        outer,
    );
    db.transaction_started();

    if let Err(err) = init_transaction(db, &mut tra, &reservations) {
        abandon(db, &mut tra);
        return Err(err);
    }
    debug!(
        number,
        oldest = tra.snapshot().oldest,
        oldest_active = tra.snapshot().oldest_active,
        isolation = ?isolation,
        "transaction started"
    );
    Ok(tra)
}

fn init_transaction(
    db: &DatabaseShared,
    tra: &mut Transaction,
    reservations: &[super::ExpandedReservation],
) -> TxResult<()> {
    let number = tra.number();
    let tpc = db.tpc();
    let tracker = db.tracker();
    let header = db.watermarks().read_snapshot();

    let mut oldest = tpc
        .find_first_in_range(
            header.oit,
            number,
            StateMask::ACTIVE | StateMask::LIMBO | StateMask::DEAD,
        )?
        .unwrap_or(number);

    let mut oldest_active = number;
    let mut cursor = header.oat.max(oldest);
    while let Some(candidate) = tpc.find_first_in_range(cursor, number, StateMask::ACTIVE)? {
        if resolve_orphan(db, candidate)? == TraState::Active {
            oldest_active = candidate;
            break;
        }
        cursor = candidate + 1;
    }
    let lock = tra
        .lock
        .ok_or_else(|| TxError::consistency(format!("transaction {} has no lock", number)))?;
    if let Some(published) = tracker.query_oldest_active(Some(lock)) {
        oldest_active = oldest_active.min(published);
    }
    oldest = oldest.min(oldest_active);
    tracker.publish(lock, oldest_active);

    let snapshot_number = if tra.isolation().is_read_committed() {
        tpc.latest_commit_number()
    } else {
        let handle = tpc.begin_snapshot(number);
        tra.snapshot_handle = Some(handle);
        handle.number
    };
    tra.set_snapshot(Snapshot {
        oldest,
        oldest_active,
        number: snapshot_number,
    });

    let oldest_snapshot = tpc
        .oldest_snapshot_owner()
        .unwrap_or(number)
        .clamp(oldest_active, number);
    let merged = db
        .watermarks()
        .advance(Some(oldest), Some(oldest_active), Some(oldest_snapshot))?;

    // 只读的读已提交事务不会产生垃圾，出生即提交
    if tra.is_read_only() && tra.is_read_committed() {
        tpc.set_state(number, TraState::Precommitted, WriteHint::NoFlush)?;
        tra.flags.insert(TraFlags::PRECOMMITTED);
        if let Some(lock) = tra.lock.take() {
            tracker.release(lock);
        }
        trace!(number, "transaction precommitted");
    }

    if db.sweep_trigger().should_sweep(merged.oit, oldest_active) {
        debug!(oit = merged.oit, oldest_active, "sweep interval exceeded");
        db.sweep_trigger().request();
    }

    if !tra.flags.contains(TraFlags::NO_AUTO_UNDO) {
        tra.savepoints.start(None);
    }

    for reservation in reservations {
        let id = db.locks().lock(
            tra.owner(),
            LockKey::relation(reservation.relation_id),
            reservation.level,
            tra.lock_wait(),
        )?;
        tra.reservation_locks.push(id);
    }
    Ok(())
}

/// 启动失败：事务号置为 Dead 并释放全部资源
fn abandon(db: &DatabaseShared, tra: &mut Transaction) {
    tra.final_state = Some(TraState::Dead);
    if !tra.flags.contains(TraFlags::PRECOMMITTED) {
        if let Err(err) = db
            .tpc()
            .set_state(tra.number(), TraState::Dead, WriteHint::NoFlush)
        {
            warn!(number = tra.number(), error = %err, "failed to mark abandoned transaction dead");
        }
    }
    release(db, tra);
}

/// 释放事务持有的全部锁和快照
pub fn release(db: &DatabaseShared, tra: &mut Transaction) {
    if tra.released {
        return;
    }
    let tpc = db.tpc();
    if let Some(handle) = tra.statement.take() {
        tpc.end_snapshot(handle);
    }
    if let Some(handle) = tra.snapshot_handle.take() {
        tpc.end_snapshot(handle);
    }
    for lock in tra.resources.drain_locks() {
        db.locks().release(lock);
    }
    for lock in tra.reservation_locks.drain(..) {
        db.locks().release(lock);
    }
    if let Some(lock) = tra.lock.take() {
        db.tracker().release(lock);
    }
    tra.savepoints.discard_all();
    tra.deferred.clear();
    tra.post_commit.clear();
    tra.request_depth = 0;
    tra.released = true;
    db.transaction_released();
    trace!(number = tra.number(), "transaction released");
}

fn ensure_live(tra: &Transaction) -> TxResult<()> {
    if tra.released {
        return Err(TxError::TransactionEnded {
            number: tra.number(),
            state: tra.final_state.unwrap_or(TraState::Dead),
        });
    }
    Ok(())
}

fn perform_deferred(tra: &mut Transaction) -> TxResult<()> {
    let number = tra.number();
    while !tra.deferred.is_empty() {
        let mut work = tra.deferred.remove(0);
        if let Err(err) = work.perform(number) {
            warn!(number, work = work.name(), error = %err, "deferred work failed");
            tra.deferred.insert(0, work);
            return Err(err);
        }
        tra.post_commit.push(work);
    }
    Ok(())
}

fn run_post_commit(tra: &mut Transaction) {
    let number = tra.number();
    for mut work in tra.post_commit.drain(..) {
        work.post_commit(number);
    }
}

fn forget_description(db: &DatabaseShared, tra: &Transaction) {
    if tra.is_prepared() {
        if let Err(err) = db.store().delete_meta(&limbo_key(tra.number())) {
            warn!(number = tra.number(), error = %err, "failed to remove limbo description");
        }
    }
}

/// 为保留上下文分配新事务号，新存活锁沿用旧锁的 oldest-active
fn retain_ticket(db: &DatabaseShared, tra: &Transaction) -> TxResult<RetainTicket> {
    let tracker = db.tracker();
    let payload = tra
        .lock
        .and_then(|lock| tracker.payload(lock))
        .unwrap_or(tra.snapshot().oldest_active);
    let owner = tra.owner();
    let (number, lock) = db
        .watermarks()
        .allocate_next(db.tip(), |n| tracker.acquire(owner, n, payload))?;
    Ok(RetainTicket::new(number, lock, tra.number()))
}

fn abandon_ticket(db: &DatabaseShared, ticket: RetainTicket) {
    if let Err(err) = db
        .tpc()
        .set_state(ticket.number(), TraState::Dead, WriteHint::NoFlush)
    {
        warn!(number = ticket.number(), error = %err, "failed to mark retained number dead");
    }
    db.tracker().release(ticket.lock());
}

/// 旧事务号已写入最终状态：释放旧存活锁，交出票据
fn hand_over(db: &DatabaseShared, tra: &mut Transaction, mut ticket: RetainTicket, committed: bool) -> CommitOutcome {
    ticket.set_previous_committed(committed);
    if let Some(lock) = tra.lock.take() {
        db.tracker().release(lock);
    }
    // 保留下来的快照归新事务号所有，OST 按新号计算
    let tpc = db.tpc();
    for handle in [&mut tra.snapshot_handle, &mut tra.statement].into_iter().flatten() {
        tpc.retarget_snapshot(handle, ticket.number());
    }
    debug!(old = tra.number(), new = ticket.number(), committed, "transaction context retained");
    CommitOutcome::Retained(ticket)
}

/// 提交事务
pub fn commit(db: &DatabaseShared, tra: &mut Transaction, retaining: bool) -> TxResult<CommitOutcome> {
    ensure_live(tra)?;
    let number = tra.number();
    if tra.is_invalidated() {
        return Err(TxError::TransactionInvalidated(number));
    }
    if tra.flags.contains(TraFlags::PRECOMMITTED) {
        if retaining {
            tra.savepoints.release_to_root();
            return Ok(CommitOutcome::Kept);
        }
        tra.final_state = Some(TraState::Committed);
        release(db, tra);
        return Ok(CommitOutcome::Released);
    }
    if retaining && !tra.wrote() && !tra.has_deferred_work() && !tra.is_prepared() {
        tra.savepoints.release_to_root();
        trace!(number, "commit retaining without changes");
        return Ok(CommitOutcome::Kept);
    }

    tra.savepoints.release_to_root();
    perform_deferred(tra)?;
    tra.savepoints.release_all();

    if tra.wrote() {
        if let Err(err) = db.page_cache().flush(FlushScope::All) {
            tra.flags.insert(TraFlags::INVALIDATED);
            return Err(err);
        }
    }

    let ticket = if retaining {
        Some(retain_ticket(db, tra)?)
    } else {
        None
    };
    let hint = if tra.wrote() || tra.is_prepared() {
        WriteHint::Force
    } else {
        WriteHint::NoFlush
    };
    if let Err(err) = db.tpc().set_state(number, TraState::Committed, hint) {
        tra.flags.insert(TraFlags::INVALIDATED);
        if let Some(ticket) = ticket {
            abandon_ticket(db, ticket);
        }
        return Err(err);
    }
    debug!(number, wrote = tra.wrote(), "transaction committed");
    tra.final_state = Some(TraState::Committed);

    run_post_commit(tra);
    forget_description(db, tra);

    match ticket {
        Some(ticket) => Ok(hand_over(db, tra, ticket, true)),
        None => {
            release(db, tra);
            Ok(CommitOutcome::Released)
        }
    }
}

/// 回滚事务
///
/// 撤销失败不会向上传播：丢弃全部保存点并把事务置为 Dead。
pub fn rollback(
    db: &DatabaseShared,
    tra: &mut Transaction,
    retaining: bool,
    force: bool,
) -> TxResult<CommitOutcome> {
    ensure_live(tra)?;
    let number = tra.number();
    if tra.flags.contains(TraFlags::PRECOMMITTED) {
        if retaining {
            tra.savepoints.release_to_root();
            return Ok(CommitOutcome::Kept);
        }
        tra.final_state = Some(TraState::Committed);
        release(db, tra);
        return Ok(CommitOutcome::Released);
    }

    let discard = force || tra.is_invalidated() || tra.flags.contains(TraFlags::NO_AUTO_UNDO);
    let undone = if discard {
        tra.savepoints.discard_all();
        false
    } else {
        match tra.savepoints.rollback_all() {
            Ok(()) => true,
            Err(err) => {
                warn!(number, error = %err, "undo failed, discarding all changes");
                tra.savepoints.discard_all();
                false
            }
        }
    };
    tra.deferred.clear();
    tra.post_commit.clear();

    let state = if undone && !tra.wrote() && !tra.is_prepared() {
        TraState::Committed
    } else {
        TraState::Dead
    };

    let ticket = if retaining {
        match retain_ticket(db, tra) {
            Ok(ticket) => Some(ticket),
            Err(err) => {
                mark_dead_after_failure(db, tra);
                return Err(err);
            }
        }
    } else {
        None
    };
    let hint = if tra.is_prepared() {
        WriteHint::Force
    } else {
        WriteHint::NoFlush
    };
    if let Err(err) = db.tpc().set_state(number, state, hint) {
        if let Some(ticket) = ticket {
            abandon_ticket(db, ticket);
        }
        mark_dead_after_failure(db, tra);
        return Err(err);
    }
    debug!(number, %state, "transaction rolled back");
    tra.final_state = Some(state);
    forget_description(db, tra);

    match ticket {
        Some(ticket) => Ok(hand_over(db, tra, ticket, state == TraState::Committed)),
        None => {
            release(db, tra);
            Ok(CommitOutcome::Released)
        }
    }
}

/// TIP 写入失败：缓存中置为 Dead 后完全释放
fn mark_dead_after_failure(db: &DatabaseShared, tra: &mut Transaction) {
    tra.final_state = Some(TraState::Dead);
    if let Err(err) = db.tpc().set_cache_state(tra.number(), TraState::Dead) {
        warn!(number = tra.number(), error = %err, "failed to mark transaction dead in cache");
    }
    release(db, tra);
}

/// 两阶段提交的第一阶段：写入描述、刷盘、进入 limbo
pub fn prepare(db: &DatabaseShared, tra: &mut Transaction, description: Option<&[u8]>) -> TxResult<()> {
    ensure_live(tra)?;
    let number = tra.number();
    if tra.is_prepared() {
        return Ok(());
    }
    if tra.is_invalidated() {
        return Err(TxError::TransactionInvalidated(number));
    }
    if tra.flags.contains(TraFlags::PRECOMMITTED) {
        return Err(TxError::NotAllowed {
            number,
            reason: "precommitted transaction cannot be prepared".into(),
        });
    }

    tra.savepoints.release_to_root();
    perform_deferred(tra)?;
    tra.savepoints.release_all();

    let result = (|| -> TxResult<()> {
        if let Some(message) = description {
            db.store().write_meta(&limbo_key(number), message)?;
        }
        db.page_cache().flush(FlushScope::All)?;
        db.tpc().set_state(number, TraState::Limbo, WriteHint::Force)?;
        Ok(())
    })();
    if let Err(err) = result {
        tra.flags.insert(TraFlags::INVALIDATED);
        return Err(err);
    }
    tra.description = description.map(<[u8]>::to_vec);
    tra.flags.insert(TraFlags::PREPARED);
    debug!(number, "transaction prepared");
    Ok(())
}

/// 重新连接一个 limbo 事务
pub fn reconnect(db: &DatabaseShared, number: TraNumber) -> TxResult<Transaction> {
    db.check_open()?;
    if number == 0 || number >= db.watermarks().next() {
        return Err(TxError::UnknownTransaction(number));
    }
    let state = db.tpc().cache_state(number)?;
    if state != TraState::Limbo {
        return Err(TxError::NotInLimbo { number, state });
    }

    let locks = db.locks();
    let owner = locks.new_owner();
    let lock = locks
        .lock(owner, LockKey::transaction(number), LockLevel::Exclusive, LockWait::NoWait)
        .map_err(|err| match err {
            TxError::LockConflict(_) => TxError::TransactionInUse(number),
            other => other,
        })?;
    let header = db.watermarks().read_snapshot();
    db.tracker().publish(lock, header.oat);

    let description = match db.store().read_meta(&limbo_key(number)) {
        Ok(description) => description,
        Err(err) => {
            locks.release(lock);
            return Err(err);
        }
    };
    let options = TransactionOptions::default();
    let mut tra = Transaction::new(
        number,
        options.isolation,
        options.clone(),
        TraFlags::RECONNECTED | TraFlags::PREPARED,
        options.lock_wait(db.config().lock_timeout()),
        owner,
        lock,
        Snapshot {
            oldest: header.oit,
            oldest_active: header.oat,
            number: db.tpc().latest_commit_number(),
        },
        None,
    );
    tra.description = description;
    db.transaction_started();
    debug!(number, "reconnected limbo transaction");
    Ok(tra)
}

/// 等待事务结束并返回其最终状态
///
/// 等到锁后状态仍为 Active，说明持有者已崩溃，强制置为 Dead。
pub fn wait_for(
    db: &DatabaseShared,
    owner: LockOwner,
    number: TraNumber,
    wait: LockWait,
) -> TxResult<TraState> {
    let state = db.tpc().cache_state(number)?;
    if state != TraState::Active {
        return Ok(state);
    }
    db.tracker().wait(owner, number, wait)?;
    let state = db.tpc().cache_state(number)?;
    if state == TraState::Active {
        warn!(number, "transaction ended without resolving its state, marking dead");
        db.tpc().set_state(number, TraState::Dead, WriteHint::NoFlush)?;
        return Ok(TraState::Dead);
    }
    Ok(state)
}

/// 登记事务依赖的资源，持有共享存在锁直到事务结束
pub fn post_resource(db: &DatabaseShared, tra: &mut Transaction, resource: ResourceRef) -> TxResult<()> {
    ensure_live(tra)?;
    if tra.resources.contains(&resource) {
        return Ok(());
    }
    let lock = db
        .locks()
        .lock(
            tra.owner(),
            LockKey::existence(resource.kind, resource.id),
            LockLevel::SharedRead,
            tra.lock_wait(),
        )
        .map_err(|err| match err {
            TxError::LockConflict(_) | TxError::LockTimeout(_) => {
                TxError::ResourceInUse(resource.to_string())
            }
            other => other,
        })?;
    trace!(number = tra.number(), %resource, "resource posted");
    tra.resources.push(resource, lock);
    Ok(())
}

/// 语句开始：读一致性事务固定语句快照
pub fn start_request(db: &DatabaseShared, tra: &mut Transaction) -> TxResult<()> {
    ensure_live(tra)?;
    tra.request_depth += 1;
    if tra.request_depth == 1 && tra.isolation().is_read_consistency() {
        tra.statement = Some(db.tpc().begin_snapshot(tra.number()));
    }
    Ok(())
}

/// 语句结束，返回是否回到了最外层
pub fn finish_request(db: &DatabaseShared, tra: &mut Transaction) -> bool {
    if tra.request_depth == 0 {
        return false;
    }
    tra.request_depth -= 1;
    if tra.request_depth > 0 {
        return false;
    }
    if let Some(handle) = tra.statement.take() {
        db.tpc().end_snapshot(handle);
    }
    true
}

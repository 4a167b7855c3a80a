// 并发测试
// 并发开始事务扩展 TIP、随机调度下的水位线、跨线程等待与崩溃判定

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rs_txdb::lock::LockWait;
use rs_txdb::transactions;
use rs_txdb::{Attachment, Database, EngineConfig, TraNumber, TraState, TransactionOptions, TxError};
use std::collections::HashSet;
use std::thread;
use std::time::Duration;

fn setup() -> Database {
    Database::create_in_memory(EngineConfig::small_pages(64).with_sweep_interval(0)).unwrap()
}

#[test]
fn test_concurrent_starts_extend_tip() {
    let db = setup();
    const THREADS: usize = 8;
    const PER_THREAD: usize = 125;

    let results: Vec<(Attachment, Vec<TraNumber>)> = thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    let mut att = db.attach().unwrap();
                    let mut numbers = Vec::with_capacity(PER_THREAD);
                    for _ in 0..PER_THREAD {
                        let h = att.start(&TransactionOptions::default()).unwrap();
                        numbers.push(att.number(h).unwrap());
                    }
                    (att, numbers)
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let mut all = HashSet::new();
    for (_, numbers) in &results {
        for window in numbers.windows(2) {
            assert!(window[0] < window[1]);
        }
        for n in numbers {
            assert!(all.insert(*n), "transaction number {} allocated twice", n);
            assert_eq!(db.transaction_state(*n).unwrap(), TraState::Active);
            assert_eq!(db.tip_state(*n).unwrap(), TraState::Active);
        }
    }
    assert_eq!(all.len(), THREADS * PER_THREAD);
    // 事务号 1..=1000，每页 64 个
    assert_eq!(db.tip_page_count(), (1000 + 63) / 64);
    assert!(db.watermarks().is_ordered());
    drop(results);
    assert_eq!(db.shared().live_transactions(), 0);
}

#[test]
fn test_random_schedule_keeps_watermarks_ordered() {
    let db = setup();
    thread::scope(|scope| {
        for seed in 0..4u64 {
            let db = &db;
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut att = db.attach().unwrap();
                let mut open = Vec::new();
                for _ in 0..200 {
                    match rng.gen_range(0..5) {
                        0 | 1 => open.push(att.start(&TransactionOptions::default()).unwrap()),
                        2 if !open.is_empty() => {
                            let h = open.swap_remove(rng.gen_range(0..open.len()));
                            att.transaction_mut(h).unwrap().mark_write().unwrap();
                            att.commit(h).unwrap();
                        }
                        3 if !open.is_empty() => {
                            let h = open.swap_remove(rng.gen_range(0..open.len()));
                            att.rollback(h).unwrap();
                        }
                        4 if !open.is_empty() => {
                            let h = open[rng.gen_range(0..open.len())];
                            att.transaction_mut(h).unwrap().mark_write().unwrap();
                            att.commit_retaining(h).unwrap();
                        }
                        _ => {}
                    }
                    assert!(db.watermarks().is_ordered());
                }
            });
        }
    });
    let wm = db.watermarks();
    assert!(wm.is_ordered());
    assert_eq!(db.shared().live_transactions(), 0);
}

#[test]
fn test_wait_for_returns_final_state() {
    let db = setup();
    let mut writer_att = db.attach().unwrap();
    let writer = writer_att.start(&TransactionOptions::default()).unwrap();
    let writer_number = writer_att.number(writer).unwrap();
    writer_att.transaction_mut(writer).unwrap().mark_write().unwrap();

    let mut reader_att = db.attach().unwrap();
    let reader = reader_att.start(&TransactionOptions::default()).unwrap();
    assert!(matches!(
        transactions::wait_for(
            db.shared(),
            reader_att.transaction(reader).unwrap().owner(),
            writer_number,
            LockWait::NoWait
        ),
        Err(TxError::LockConflict(_))
    ));

    let state = thread::scope(|scope| {
        let waiter = scope.spawn(move || reader_att.wait_for(reader, writer_number));
        thread::sleep(Duration::from_millis(50));
        writer_att.commit(writer).unwrap();
        waiter.join().unwrap()
    });
    assert_eq!(state.unwrap(), TraState::Committed);
}

#[test]
fn test_crashed_transaction_resolves_dead() {
    let db = setup();
    let shared = db.shared().clone();
    let mut tra = transactions::start(&shared, &TransactionOptions::default(), None).unwrap();
    let number = tra.number();

    // 存活锁被释放但状态没有写入，相当于持有者崩溃
    transactions::release(&shared, &mut tra);
    assert_eq!(db.transaction_state(number).unwrap(), TraState::Active);

    let owner = shared.locks().new_owner();
    assert_eq!(
        transactions::wait_for(&shared, owner, number, LockWait::NoWait).unwrap(),
        TraState::Dead
    );
    assert_eq!(db.transaction_state(number).unwrap(), TraState::Dead);
}

#[test]
fn test_start_resolves_orphans() {
    let db = setup();
    let shared = db.shared().clone();
    let mut orphan = transactions::start(&shared, &TransactionOptions::default(), None).unwrap();
    let number = orphan.number();
    transactions::release(&shared, &mut orphan);

    let mut att = db.attach().unwrap();
    let h = att.start(&TransactionOptions::default()).unwrap();
    // 启动时扫描发现没有锁持有者的 Active 事务，将其置为 Dead
    assert_eq!(db.transaction_state(number).unwrap(), TraState::Dead);
    assert!(att.transaction(h).unwrap().snapshot().oldest_active > number);
}

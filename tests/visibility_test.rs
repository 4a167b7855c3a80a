// 可见性测试
// 快照隔离、读已提交、读一致性语句快照、保留上下文后的可读性

use proptest::prelude::*;
use rs_txdb::{Database, EngineConfig, ReadCommittedMode, TraState, TransactionOptions};

fn setup() -> Database {
    Database::create_in_memory(EngineConfig::small_pages(64).with_sweep_interval(0)).unwrap()
}

// ========== 基本规则 ==========

#[test]
fn test_self_visibility() {
    let db = setup();
    let mut att = db.attach().unwrap();
    for options in [
        TransactionOptions::default(),
        TransactionOptions::consistency(),
        TransactionOptions::read_committed(ReadCommittedMode::RecordVersion),
        TransactionOptions::read_committed(ReadCommittedMode::ReadConsistency).read_only(),
    ] {
        let h = att.start(&options).unwrap();
        let n = att.number(h).unwrap();
        assert_eq!(att.is_visible(h, n).unwrap(), TraState::Us);
    }
}

#[test]
fn test_system_transaction_is_committed() {
    let db = setup();
    let mut att = db.attach().unwrap();
    let h = att.start(&TransactionOptions::default()).unwrap();
    assert_eq!(att.is_visible(h, 0).unwrap(), TraState::Committed);
}

#[test]
fn test_prehistoric_transactions_are_committed() {
    let db = setup();
    let mut att = db.attach().unwrap();
    let mut old = Vec::new();
    for _ in 0..10 {
        let h = att.start(&TransactionOptions::default()).unwrap();
        old.push(att.number(h).unwrap());
        att.commit(h).unwrap();
    }
    let reader = att.start(&TransactionOptions::default()).unwrap();
    let oldest = att.transaction(reader).unwrap().snapshot().oldest;
    for n in old {
        assert!(n < oldest);
        assert_eq!(att.is_visible(reader, n).unwrap(), TraState::Committed);
    }
}

// ========== 快照隔离场景 ==========

#[test]
fn test_snapshot_scenario() {
    let db = setup();
    let mut att = db.attach().unwrap();
    let a = att.start(&TransactionOptions::default()).unwrap();
    let a_number = att.number(a).unwrap();
    att.transaction_mut(a).unwrap().mark_write().unwrap();

    let b = att.start(&TransactionOptions::default()).unwrap();
    assert_eq!(att.is_visible(b, a_number).unwrap(), TraState::Active);

    att.commit(a).unwrap();
    let c = att.start(&TransactionOptions::default()).unwrap();
    assert_eq!(att.is_visible(c, a_number).unwrap(), TraState::Committed);
    // B 的快照不变
    assert_eq!(att.is_visible(b, a_number).unwrap(), TraState::Active);
}

#[test]
fn test_dead_and_limbo_literal_states() {
    let db = setup();
    let mut att = db.attach().unwrap();
    let dead = att.start(&TransactionOptions::default()).unwrap();
    let dead_number = att.number(dead).unwrap();
    att.transaction_mut(dead).unwrap().mark_write().unwrap();
    att.rollback(dead).unwrap();

    let limbo = att.start(&TransactionOptions::default()).unwrap();
    let limbo_number = att.number(limbo).unwrap();
    att.prepare(limbo, None).unwrap();

    let reader = att.start(&TransactionOptions::default()).unwrap();
    assert_eq!(att.is_visible(reader, dead_number).unwrap(), TraState::Dead);
    assert_eq!(att.is_visible(reader, limbo_number).unwrap(), TraState::Limbo);
    att.rollback(limbo).unwrap();
}

// ========== 读已提交 ==========

#[test]
fn test_read_committed_sees_latest() {
    let db = setup();
    let mut att = db.attach().unwrap();
    let reader = att
        .start(&TransactionOptions::read_committed(ReadCommittedMode::RecordVersion))
        .unwrap();
    let writer = att.start(&TransactionOptions::default()).unwrap();
    let w = att.number(writer).unwrap();
    assert_eq!(att.is_visible(reader, w).unwrap(), TraState::Active);
    att.commit(writer).unwrap();
    assert_eq!(att.is_visible(reader, w).unwrap(), TraState::Committed);
}

#[test]
fn test_read_consistency_statement_snapshot() {
    let db = setup();
    let mut att = db.attach().unwrap();
    let reader = att
        .start(&TransactionOptions::read_committed(ReadCommittedMode::ReadConsistency))
        .unwrap();
    let writer = att.start(&TransactionOptions::default()).unwrap();
    let w = att.number(writer).unwrap();

    att.start_request(reader).unwrap();
    let before = att.is_visible(reader, w).unwrap();
    att.transaction_mut(writer).unwrap().mark_write().unwrap();
    att.commit(writer).unwrap();
    // 同一语句内结果不变
    assert_eq!(before, TraState::Active);
    assert_eq!(att.is_visible(reader, w).unwrap(), before);
    att.finish_request(reader).unwrap();

    // 下一个语句看到新提交
    att.start_request(reader).unwrap();
    assert_eq!(att.is_visible(reader, w).unwrap(), TraState::Committed);
    att.finish_request(reader).unwrap();
}

#[test]
fn test_nested_requests_share_statement_snapshot() {
    let db = setup();
    let mut att = db.attach().unwrap();
    let reader = att
        .start(&TransactionOptions::read_committed(ReadCommittedMode::ReadConsistency))
        .unwrap();
    att.start_request(reader).unwrap();
    let pinned = att.transaction(reader).unwrap().statement_snapshot();
    assert!(pinned.is_some());

    let writer = att.start(&TransactionOptions::default()).unwrap();
    att.transaction_mut(writer).unwrap().mark_write().unwrap();
    att.commit(writer).unwrap();

    att.start_request(reader).unwrap();
    assert_eq!(att.transaction(reader).unwrap().statement_snapshot(), pinned);
    att.finish_request(reader).unwrap();
    assert_eq!(att.transaction(reader).unwrap().statement_snapshot(), pinned);
    att.finish_request(reader).unwrap();
    assert_eq!(att.transaction(reader).unwrap().statement_snapshot(), None);
}

#[test]
fn test_config_forces_read_consistency() {
    let db = Database::create_in_memory(
        EngineConfig::small_pages(64)
            .with_sweep_interval(0)
            .with_read_consistency(true),
    )
    .unwrap();
    let mut att = db.attach().unwrap();
    let h = att
        .start(&TransactionOptions::read_committed(ReadCommittedMode::RecordVersion))
        .unwrap();
    assert!(att.transaction(h).unwrap().isolation().is_read_consistency());
}

// ========== 保留上下文后的可读性 ==========

#[test]
fn test_retained_number_readable() {
    let db = setup();
    let mut att = db.attach().unwrap();
    let rc_reader = att
        .start(&TransactionOptions::read_committed(ReadCommittedMode::RecordVersion))
        .unwrap();
    let h = att.start(&TransactionOptions::default()).unwrap();
    let a = att.number(h).unwrap();
    att.transaction_mut(h).unwrap().mark_write().unwrap();
    att.commit_retaining(h).unwrap();
    let b = att.number(h).unwrap();
    assert_ne!(a, b);

    // 保留事务自身、读已提交读者和之后开始的读者都把 A 视为已提交
    assert_eq!(att.is_visible(h, a).unwrap(), TraState::Committed);
    assert_eq!(att.is_visible(rc_reader, a).unwrap(), TraState::Committed);
    let later = att.start(&TransactionOptions::default()).unwrap();
    assert_eq!(att.is_visible(later, a).unwrap(), TraState::Committed);
    assert_eq!(att.is_visible(later, b).unwrap(), TraState::Active);
    assert_eq!(att.is_visible(h, b).unwrap(), TraState::Us);
}

// ========== 随机调度 ==========

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_commit_visibility_matches_order(ops in proptest::collection::vec(0u8..3, 1..40)) {
        let db = setup();
        let mut att = db.attach().unwrap();
        let mut finished = Vec::new();
        for op in ops {
            let h = att.start(&TransactionOptions::default()).unwrap();
            let n = att.number(h).unwrap();
            match op {
                0 => {
                    att.transaction_mut(h).unwrap().mark_write().unwrap();
                    att.commit(h).unwrap();
                    finished.push((n, TraState::Committed));
                }
                1 => {
                    att.transaction_mut(h).unwrap().mark_write().unwrap();
                    att.rollback(h).unwrap();
                    finished.push((n, TraState::Dead));
                }
                _ => {
                    att.rollback(h).unwrap();
                    finished.push((n, TraState::Committed));
                }
            }
            let wm = db.watermarks();
            prop_assert!(wm.is_ordered());
        }
        let reader = att.start(&TransactionOptions::default()).unwrap();
        let oldest = att.transaction(reader).unwrap().snapshot().oldest;
        for (n, state) in finished {
            let seen = att.is_visible(reader, n).unwrap();
            if n < oldest {
                prop_assert_eq!(seen, TraState::Committed);
            } else {
                prop_assert_eq!(seen, state);
            }
        }
    }
}

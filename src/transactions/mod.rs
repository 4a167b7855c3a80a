// 事务管理模块
//
// 提供基于 TIP（事务清单页）的多版本并发控制：
// - 事务号分配与生命周期管理
// - 提交 / 回滚 / 保留提交 / 两阶段准备（limbo）
// - 基于锁的事务存活检测
// - 可见性判定（快照隔离与读已提交）
// - 保存点、资源登记、关系预留

pub mod flags;
pub mod tpb;
pub mod reservation;
pub mod savepoint;
pub mod resources;
pub mod transaction;
pub mod liveness;
pub mod lifecycle;
pub mod visibility;

pub use flags::TraFlags;
pub use tpb::{
    parse_tpb, AccessMode, Reservation, ReserveAccess, ShareMode, TransactionOptions,
    MAX_IDENTIFIER_LENGTH,
};
pub use reservation::{
    expand_reservations, ExpandedReservation, MemCatalog, RelationCatalog, RelationInfo,
    RelationKind, MAX_VIEW_DEPTH,
};
pub use savepoint::{SavepointHandle, SavepointStack, UndoAction};
pub use resources::{DeferredWork, PostedResources, ResourceKind, ResourceRef};
pub use transaction::{CommitOutcome, RetainTicket, Snapshot, Transaction};
pub use liveness::TraLockTracker;
pub use lifecycle::{
    commit, finish_request, post_resource, prepare, reconnect, release, rollback, start,
    start_request, wait_for,
};
pub use visibility::snapshot_state;

use serde::{Deserialize, Serialize};
use std::fmt;

/// 事务号
pub type TraNumber = u64;

/// 系统事务号，永远视为已提交
pub const SYSTEM_TRANSACTION: TraNumber = 0;

/// 事务状态
///
/// 磁盘上以 2 位编码，`Precommitted` 落盘时与 `Committed` 相同，
/// `Us` 仅在事务查询自身时返回。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraState {
    Active,
    Limbo,
    Dead,
    Committed,
    Precommitted,
    Us,
}

impl TraState {
    /// 2 位磁盘编码
    pub fn to_bits(self) -> Option<u8> {
        match self {
            TraState::Active => Some(0),
            TraState::Limbo => Some(1),
            TraState::Dead => Some(2),
            TraState::Committed | TraState::Precommitted => Some(3),
            TraState::Us => None,
        }
    }

    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => TraState::Active,
            1 => TraState::Limbo,
            2 => TraState::Dead,
            _ => TraState::Committed,
        }
    }

    /// 终结状态不会再改变
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TraState::Dead | TraState::Committed | TraState::Precommitted
        )
    }

    pub fn is_committed(self) -> bool {
        matches!(self, TraState::Committed | TraState::Precommitted)
    }
}

impl fmt::Display for TraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TraState::Active => "active",
            TraState::Limbo => "limbo",
            TraState::Dead => "dead",
            TraState::Committed => "committed",
            TraState::Precommitted => "precommitted",
            TraState::Us => "self",
        };
        f.write_str(name)
    }
}

/// 读已提交的子模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadCommittedMode {
    /// 读取最新已提交版本
    RecordVersion,
    /// 遇到活动写者时等待其结束
    NoRecordVersion,
    /// 每个语句固定一个提交号快照
    ReadConsistency,
}

/// 事务隔离级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationMode {
    /// 快照隔离
    Concurrency,
    /// 可串行化（表级保护预留）
    Consistency,
    /// 读已提交
    ReadCommitted(ReadCommittedMode),
}

impl Default for IsolationMode {
    fn default() -> Self {
        Self::Concurrency
    }
}

impl IsolationMode {
    pub fn is_read_committed(&self) -> bool {
        matches!(self, IsolationMode::ReadCommitted(_))
    }

    pub fn is_read_consistency(&self) -> bool {
        matches!(
            self,
            IsolationMode::ReadCommitted(ReadCommittedMode::ReadConsistency)
        )
    }
}

// 错误类型定义
//
// 事务子系统的统一错误类型，按类别划分：
// 协议错误、一致性错误、资源冲突、过期事务、I/O 错误、关闭/取消

use crate::storage::PageNumber;
use crate::transactions::{TraNumber, TraState};
use std::io;
use thiserror::Error;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 非法的事务参数、冲突的预留、超长标识符
    Protocol,
    /// 水位线顺序被破坏等内部一致性错误（致命）
    Consistency,
    /// 锁等待超时、死锁（可重试）
    Conflict,
    /// 对非 limbo 事务重连、提交已失效事务
    Stale,
    /// 页读写失败
    Io,
    /// 关闭或取消
    Shutdown,
}

/// 事务子系统错误
#[derive(Error, Debug)]
pub enum TxError {
    // ---------- 协议错误 ----------
    #[error("invalid transaction parameter buffer: {0}")]
    InvalidTpb(String),

    #[error("conflicting transaction options: {0}")]
    OptionConflict(String),

    #[error("identifier '{name}' exceeds {max} bytes")]
    IdentifierTooLong { name: String, max: usize },

    #[error("relation '{0}' is reserved with conflicting lock modes")]
    ReservationConflict(String),

    #[error("view '{0}' exceeds the maximum view nesting depth")]
    ViewDepthExceeded(String),

    #[error("relation '{0}' is not defined")]
    UnknownRelation(String),

    #[error("attempted update during read-only transaction {0}")]
    ReadOnlyTransaction(TraNumber),

    #[error("operation not allowed for transaction {number}: {reason}")]
    NotAllowed { number: TraNumber, reason: String },

    #[error("savepoint {0} not found")]
    SavepointNotFound(String),

    #[error("transaction handle {0} is not valid")]
    InvalidHandle(u64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ---------- 一致性错误 ----------
    #[error("internal consistency check failed: {0}")]
    Consistency(String),

    // ---------- 资源冲突 ----------
    #[error("lock conflict on {0}")]
    LockConflict(String),

    #[error("lock time-out on wait for {0}")]
    LockTimeout(String),

    #[error("deadlock detected while waiting for {0}")]
    Deadlock(String),

    #[error("transaction {0} is in use by another attachment")]
    TransactionInUse(TraNumber),

    #[error("object {0} is in use")]
    ResourceInUse(String),

    #[error("record from transaction {0} is stuck in limbo")]
    RecordInLimbo(TraNumber),

    #[error("update conflicts with concurrent update by transaction {0}")]
    UpdateConflict(TraNumber),

    // ---------- 过期事务 ----------
    #[error("transaction {number} is not in limbo, it is {state}")]
    NotInLimbo { number: TraNumber, state: TraState },

    #[error("transaction {0} does not exist")]
    UnknownTransaction(TraNumber),

    #[error("transaction {0} is marked invalid and cannot be committed")]
    TransactionInvalidated(TraNumber),

    #[error("transaction {number} already ended with state {state}")]
    TransactionEnded { number: TraNumber, state: TraState },

    // ---------- I/O 错误 ----------
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("page codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("configuration parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("page {0} does not exist")]
    PageMissing(PageNumber),

    #[error("page {page} is corrupt: {reason}")]
    CorruptPage { page: PageNumber, reason: String },

    // ---------- 关闭/取消 ----------
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("database is shut down")]
    Shutdown,
}

impl TxError {
    /// 获取错误类别
    pub fn category(&self) -> ErrorCategory {
        use TxError::*;
        match self {
            InvalidTpb(_)
            | OptionConflict(_)
            | IdentifierTooLong { .. }
            | ReservationConflict(_)
            | ViewDepthExceeded(_)
            | UnknownRelation(_)
            | ReadOnlyTransaction(_)
            | NotAllowed { .. }
            | SavepointNotFound(_)
            | InvalidHandle(_)
            | InvalidConfig(_) => ErrorCategory::Protocol,
            Consistency(_) => ErrorCategory::Consistency,
            LockConflict(_)
            | LockTimeout(_)
            | Deadlock(_)
            | TransactionInUse(_)
            | ResourceInUse(_)
            | RecordInLimbo(_)
            | UpdateConflict(_) => ErrorCategory::Conflict,
            NotInLimbo { .. }
            | UnknownTransaction(_)
            | TransactionInvalidated(_)
            | TransactionEnded { .. } => ErrorCategory::Stale,
            Io(_) | Sled(_) | Codec(_) | Json(_) | PageMissing(_) | CorruptPage { .. } => {
                ErrorCategory::Io
            }
            Cancelled(_) | Shutdown => ErrorCategory::Shutdown,
        }
    }

    /// 一致性错误是致命的，调用方不得继续
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Consistency
    }

    /// 资源冲突可以重试
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Conflict
    }

    /// 构造一致性错误并记录日志
    pub(crate) fn consistency(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(reason = %msg, "consistency check failed");
        TxError::Consistency(msg)
    }
}

/// 事务结果类型
pub type TxResult<T> = Result<T, TxError>;

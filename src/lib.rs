pub mod error;
pub mod config;
pub mod storage;
pub mod header;
pub mod tip;
pub mod tpc;
pub mod lock;
pub mod transactions;
pub mod sweep;
pub mod database;
pub mod attachment;
pub mod record;

pub use crate::attachment::{Attachment, TransactionHandle};
pub use crate::config::EngineConfig;
pub use crate::database::{Database, DatabaseShared, MonitorSnapshot};
pub use crate::error::{ErrorCategory, TxError, TxResult};
pub use crate::header::WatermarkSnapshot;
pub use crate::record::{RecordTable, RecordVersion, VersionChain};
pub use crate::sweep::{GarbageCollector, SweepCheckpoint, SweepReport};
pub use crate::transactions::{
    IsolationMode, ReadCommittedMode, TraNumber, TraState, Transaction, TransactionOptions,
};

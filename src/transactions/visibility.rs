// 可见性判定
//
// 每读一个记录版本都会调用 snapshot_state，常见路径只访问状态缓存。

use super::{TraNumber, TraState, Transaction, SYSTEM_TRANSACTION};
use crate::error::TxResult;
use crate::tpc::{TipCache, CN_ACTIVE, CN_DEAD, CN_LIMBO};
use tracing::trace;

/// 读事务眼中写事务的状态
pub fn snapshot_state(tpc: &TipCache, reader: &Transaction, writer: TraNumber) -> TxResult<TraState> {
    if writer == reader.number() {
        return Ok(TraState::Us);
    }
    if writer == SYSTEM_TRANSACTION
        || reader.is_commit_sub_trans(writer)
        || writer < reader.snapshot().oldest
    {
        return Ok(TraState::Committed);
    }

    let cn = tpc.snapshot_state(writer)?;
    let state = match cn {
        CN_ACTIVE => TraState::Active,
        CN_LIMBO => TraState::Limbo,
        CN_DEAD => TraState::Dead,
        cn => {
            // 读已提交只受语句快照约束，其余隔离级别受事务快照约束
            let horizon = if reader.is_read_committed() {
                reader.statement_snapshot()
            } else {
                Some(reader.snapshot().number)
            };
            match horizon {
                Some(horizon) if cn > horizon => TraState::Active,
                _ => TraState::Committed,
            }
        }
    };
    trace!(reader = reader.number(), writer, cn, %state, "visibility");
    Ok(state)
}

// 事务清单页（TIP）模块
//
// 每个事务的状态以 2 位编码存放在链式 TIP 页中，
// 第 N 页保存事务号 [N·k, (N+1)·k) 的状态，k 为每页事务数。

pub mod page;
pub mod store;

pub use page::{TipBitmap, TipBitmapMut, TipPageHeader, TIP_PAGE_TYPE};
pub use store::TipStore;

use crate::transactions::TraNumber;

/// TIP 页头预留的字节数，位图从该偏移开始
pub const TIP_HEADER_SIZE: usize = 16;

/// 状态写入提示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteHint {
    /// 立即刷盘
    Force,
    /// 只标记脏页
    NoFlush,
}

/// 事务号在 TIP 中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipLocation {
    /// TIP 页序号
    pub sequence: u64,
    /// 位图内的字节偏移
    pub byte: usize,
    /// 字节内的位移（0、2、4、6）
    pub shift: u32,
}

/// TIP 布局：事务号到页位置的纯函数映射
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipLayout {
    transactions_per_page: u64,
}

impl TipLayout {
    pub fn new(transactions_per_page: u64) -> Self {
        debug_assert!(transactions_per_page > 0);
        Self {
            transactions_per_page,
        }
    }

    pub fn transactions_per_page(&self) -> u64 {
        self.transactions_per_page
    }

    pub fn page_sequence(&self, id: TraNumber) -> u64 {
        id / self.transactions_per_page
    }

    /// 该页保存的第一个事务号
    pub fn first_id(&self, sequence: u64) -> TraNumber {
        sequence * self.transactions_per_page
    }

    pub fn locate(&self, id: TraNumber) -> TipLocation {
        let slot = id % self.transactions_per_page;
        TipLocation {
            sequence: self.page_sequence(id),
            byte: (slot / 4) as usize,
            shift: ((slot % 4) * 2) as u32,
        }
    }

    /// 位图字节数
    pub fn bitmap_len(&self) -> usize {
        ((self.transactions_per_page + 3) / 4) as usize
    }
}

// 页存储模块
//
// 固定大小页的持久化接口，以及其上的页缓存

pub mod mem_store;
pub mod sled_store;
pub mod page_cache;

pub use mem_store::MemPageStore;
pub use page_cache::{FlushScope, PageCache, PageCacheStats};
pub use sled_store::SledPageStore;

use crate::error::TxResult;

/// 页号
pub type PageNumber = u32;

/// 头页固定为 0 号页
pub const HEADER_PAGE: PageNumber = 0;

/// 页存储引擎
///
/// 提供原始页读写和少量命名元数据（TIP 页索引、limbo 事务描述等）。
/// 写入的页在 `sync` 返回后视为持久。
pub trait PageStore: Send + Sync {
    /// 读取一页，页不存在时返回 `None`
    fn read_page(&self, page: PageNumber) -> TxResult<Option<Vec<u8>>>;

    /// 写入一页
    fn write_page(&self, page: PageNumber, data: &[u8]) -> TxResult<()>;

    /// 已分配的页数（最大页号 + 1）
    fn page_count(&self) -> TxResult<PageNumber>;

    /// 刷盘
    fn sync(&self) -> TxResult<()>;

    fn read_meta(&self, key: &str) -> TxResult<Option<Vec<u8>>>;

    fn write_meta(&self, key: &str, value: &[u8]) -> TxResult<()>;

    fn delete_meta(&self, key: &str) -> TxResult<()>;

    /// 列出指定前缀的元数据键
    fn meta_keys(&self, prefix: &str) -> TxResult<Vec<String>>;
}

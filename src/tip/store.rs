// TIP 页存储
//
// 维护 TIP 页链和内存中的已知页索引。索引滞后时（页已分配但索引未更新就崩溃）
// 通过页头中的后继指针重新扫描修复。

use super::page::{self, TipBitmap, TipBitmapMut, TipPageHeader};
use super::{TipLayout, WriteHint};
use crate::error::{TxError, TxResult};
use crate::storage::{FlushScope, PageCache, PageNumber};
use crate::transactions::{TraNumber, TraState};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, warn};

const INVENTORY_KEY: &str = "tip.inventory";

/// TIP 页存储
pub struct TipStore {
    cache: Arc<PageCache>,
    layout: TipLayout,
    /// 页序号 -> 页号
    inventory: RwLock<Vec<PageNumber>>,
    extend_lock: Mutex<()>,
}

impl TipStore {
    /// 在新数据库中创建第一个 TIP 页
    pub fn init(cache: Arc<PageCache>, layout: TipLayout) -> TxResult<Self> {
        let first = cache.allocate()?;
        cache.write(first, |data| page::format(data, 0))??;
        cache.flush(FlushScope::Page(first))?;

        let store = Self {
            cache,
            layout,
            inventory: RwLock::new(vec![first]),
            extend_lock: Mutex::new(()),
        };
        store.persist_inventory()?;
        Ok(store)
    }

    /// 打开已有的 TIP 链
    pub fn open(cache: Arc<PageCache>, layout: TipLayout, first_page: PageNumber) -> TxResult<Self> {
        let mut inventory: Vec<PageNumber> = match cache.store().read_meta(INVENTORY_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => Vec::new(),
        };
        if inventory.first() != Some(&first_page) {
            warn!(first_page, "TIP inventory does not start at the first TIP page, rebuilding");
            inventory = vec![first_page];
        }

        let store = Self {
            cache,
            layout,
            inventory: RwLock::new(inventory),
            extend_lock: Mutex::new(()),
        };
        store.rescan()?;
        Ok(store)
    }

    pub fn layout(&self) -> TipLayout {
        self.layout
    }

    pub fn first_page(&self) -> PageNumber {
        self.inventory.read()[0]
    }

    /// 已知 TIP 页数量
    pub fn page_count(&self) -> usize {
        self.inventory.read().len()
    }

    /// 已知 TIP 页号列表
    pub fn pages(&self) -> Vec<PageNumber> {
        self.inventory.read().clone()
    }

    fn persist_inventory(&self) -> TxResult<()> {
        let bytes = serde_json::to_vec(&*self.inventory.read())?;
        self.cache.store().write_meta(INVENTORY_KEY, &bytes)
    }

    /// 沿后继指针修复索引，返回新发现的页数
    pub fn rescan(&self) -> TxResult<usize> {
        let mut found = Vec::new();
        let (mut current, mut sequence) = {
            let inventory = self.inventory.read();
            (inventory[inventory.len() - 1], inventory.len() as u64 - 1)
        };

        loop {
            let header = self
                .cache
                .read(current, |data| TipPageHeader::decode(current, data))??;
            if header.sequence != sequence {
                return Err(TxError::CorruptPage {
                    page: current,
                    reason: format!(
                        "TIP sequence {} where {} was expected",
                        header.sequence, sequence
                    ),
                });
            }
            if header.next_page == 0 {
                break;
            }
            current = header.next_page;
            sequence += 1;
            found.push(current);
        }

        if !found.is_empty() {
            warn!(pages = found.len(), "TIP inventory was stale, repaired from page chain");
            self.inventory.write().extend(found.iter().copied());
            self.persist_inventory()?;
        }
        Ok(found.len())
    }

    /// 确保事务号 `id` 所在的 TIP 页存在，返回新增的页数
    pub fn extend_if_needed(&self, id: TraNumber) -> TxResult<usize> {
        let sequence = self.layout.page_sequence(id);
        if (sequence as usize) < self.inventory.read().len() {
            return Ok(0);
        }

        let _guard = self.extend_lock.lock();
        let mut added = 0;
        loop {
            let (len, last) = {
                let inventory = self.inventory.read();
                (inventory.len(), inventory[inventory.len() - 1])
            };
            if (sequence as usize) < len {
                break;
            }
            if self.rescan()? > 0 {
                continue;
            }

            // 新页先落盘并链接，再更新索引
            let page = self.cache.allocate()?;
            self.cache
                .write(page, |data| page::format(data, len as u64))??;
            self.cache
                .write(last, |data| page::set_next(last, data, page))??;
            self.cache.flush(FlushScope::Page(page))?;
            self.cache.flush(FlushScope::Page(last))?;

            self.inventory.write().push(page);
            self.persist_inventory()?;
            added += 1;
            debug!(page, sequence = len, "extended TIP chain");
        }
        Ok(added)
    }

    fn page_for(&self, sequence: u64) -> TxResult<PageNumber> {
        if let Some(page) = self.inventory.read().get(sequence as usize) {
            return Ok(*page);
        }
        self.rescan()?;
        self.inventory
            .read()
            .get(sequence as usize)
            .copied()
            .ok_or_else(|| TxError::UnknownTransaction(self.layout.first_id(sequence)))
    }

    /// 以共享闩访问某个 TIP 页的位图
    pub fn fetch_for_read<R>(&self, sequence: u64, f: impl FnOnce(TipBitmap<'_>) -> R) -> TxResult<R> {
        let page = self.page_for(sequence)?;
        let layout = self.layout;
        self.cache
            .read(page, |data| f(TipBitmap::new(data, layout, sequence)))
    }

    /// 以排他闩修改某个 TIP 页的位图
    pub fn fetch_for_write<R>(
        &self,
        sequence: u64,
        f: impl FnOnce(TipBitmapMut<'_>) -> R,
    ) -> TxResult<R> {
        let page = self.page_for(sequence)?;
        let layout = self.layout;
        self.cache
            .write(page, |data| f(TipBitmapMut::new(data, layout, sequence)))
    }

    pub fn get_state(&self, id: TraNumber) -> TxResult<TraState> {
        let sequence = self.layout.page_sequence(id);
        self.fetch_for_read(sequence, |bitmap| bitmap.state(id))
            .map_err(|e| match e {
                TxError::UnknownTransaction(_) => TxError::UnknownTransaction(id),
                other => other,
            })
    }

    pub fn set_state(&self, id: TraNumber, state: TraState, hint: WriteHint) -> TxResult<()> {
        let sequence = self.layout.page_sequence(id);
        self.fetch_for_write(sequence, |mut bitmap| bitmap.set_state(id, state))??;
        if hint == WriteHint::Force {
            let page = self.page_for(sequence)?;
            self.cache.flush(FlushScope::Page(page))?;
        }
        Ok(())
    }

    /// 读取整页的状态
    pub fn page_states(&self, sequence: u64) -> TxResult<Vec<TraState>> {
        self.fetch_for_read(sequence, |bitmap| bitmap.states())
    }
}

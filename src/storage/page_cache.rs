//! 页缓存
//!
//! 为头页和 TIP 页提供 fetch / mark-dirty / release / flush 原语。
//! 每个页帧有独立的读写闩，不同页上的操作互不阻塞。

use super::{PageNumber, PageStore};
use crate::error::{TxError, TxResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// 刷盘范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushScope {
    /// 所有脏页
    All,
    /// 单个页
    Page(PageNumber),
}

struct Frame {
    data: Vec<u8>,
    dirty: bool,
}

/// 页缓存统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub page_writes: u64,
    pub flushes: u64,
    pub resident_pages: usize,
}

/// 页缓存
///
/// 页帧常驻内存，不做淘汰。
pub struct PageCache {
    store: Arc<dyn PageStore>,
    page_size: usize,
    frames: Mutex<HashMap<PageNumber, Arc<RwLock<Frame>>>>,
    next_page: AtomicU32,
    hits: AtomicU64,
    misses: AtomicU64,
    page_writes: AtomicU64,
    flushes: AtomicU64,
}

impl PageCache {
    pub fn new(store: Arc<dyn PageStore>, page_size: usize) -> TxResult<Self> {
        let next_page = store.page_count()?;
        Ok(Self {
            store,
            page_size,
            frames: Mutex::new(HashMap::new()),
            next_page: AtomicU32::new(next_page),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            page_writes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    fn frame(&self, page: PageNumber) -> TxResult<Arc<RwLock<Frame>>> {
        if let Some(frame) = self.frames.lock().get(&page) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(frame.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let data = self
            .store
            .read_page(page)?
            .ok_or(TxError::PageMissing(page))?;
        if data.len() != self.page_size {
            return Err(TxError::CorruptPage {
                page,
                reason: format!("size {} != {}", data.len(), self.page_size),
            });
        }

        // 并发加载同一页时保留先插入的页帧
        let mut frames = self.frames.lock();
        let frame = frames
            .entry(page)
            .or_insert_with(|| Arc::new(RwLock::new(Frame { data, dirty: false })));
        Ok(frame.clone())
    }

    /// 以共享闩读取页
    pub fn read<R>(&self, page: PageNumber, f: impl FnOnce(&[u8]) -> R) -> TxResult<R> {
        let frame = self.frame(page)?;
        let guard = frame.read();
        Ok(f(&guard.data))
    }

    /// 以排他闩修改页，并标记为脏页
    pub fn write<R>(&self, page: PageNumber, f: impl FnOnce(&mut [u8]) -> R) -> TxResult<R> {
        let frame = self.frame(page)?;
        let mut guard = frame.write();
        guard.dirty = true;
        Ok(f(&mut guard.data))
    }

    /// 分配一个新页（全零、脏）
    pub fn allocate(&self) -> TxResult<PageNumber> {
        let page = self.next_page.fetch_add(1, Ordering::SeqCst);
        if page == PageNumber::MAX {
            return Err(TxError::consistency("page number space exhausted"));
        }
        let frame = Frame {
            data: vec![0; self.page_size],
            dirty: true,
        };
        self.frames.lock().insert(page, Arc::new(RwLock::new(frame)));
        Ok(page)
    }

    /// 把脏页写回存储并刷盘，返回写出的页数
    pub fn flush(&self, scope: FlushScope) -> TxResult<usize> {
        let mut targets: Vec<(PageNumber, Arc<RwLock<Frame>>)> = {
            let frames = self.frames.lock();
            match scope {
                FlushScope::All => frames.iter().map(|(p, f)| (*p, f.clone())).collect(),
                FlushScope::Page(page) => frames
                    .get(&page)
                    .map(|f| vec![(page, f.clone())])
                    .unwrap_or_default(),
            }
        };
        targets.sort_by_key(|(page, _)| *page);

        let mut written = 0;
        for (page, frame) in targets {
            let mut guard = frame.write();
            if !guard.dirty {
                continue;
            }
            self.store.write_page(page, &guard.data)?;
            guard.dirty = false;
            written += 1;
        }

        if written > 0 {
            self.store.sync()?;
            self.page_writes.fetch_add(written as u64, Ordering::Relaxed);
        }
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(written)
    }

    /// 丢弃缓存中的页帧（包括脏页），下次访问重新读取
    pub fn invalidate(&self, page: PageNumber) {
        self.frames.lock().remove(&page);
    }

    pub fn dirty_pages(&self) -> usize {
        self.frames
            .lock()
            .values()
            .filter(|f| f.read().dirty)
            .count()
    }

    pub fn stats(&self) -> PageCacheStats {
        PageCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            page_writes: self.page_writes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            resident_pages: self.frames.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemPageStore;

    fn cache() -> (Arc<MemPageStore>, PageCache) {
        let store = Arc::new(MemPageStore::new());
        let cache = PageCache::new(store.clone(), 64).unwrap();
        (store, cache)
    }

    #[test]
    fn test_allocate_write_flush() {
        let (store, cache) = cache();
        let page = cache.allocate().unwrap();
        assert_eq!(page, 0);
        cache.write(page, |data| data[0] = 42).unwrap();
        assert_eq!(cache.dirty_pages(), 1);
        assert_eq!(store.raw_page(page), None);

        assert_eq!(cache.flush(FlushScope::All).unwrap(), 1);
        assert_eq!(cache.dirty_pages(), 0);
        assert_eq!(store.raw_page(page).unwrap()[0], 42);
    }

    #[test]
    fn test_flush_single_page() {
        let (store, cache) = cache();
        let a = cache.allocate().unwrap();
        let b = cache.allocate().unwrap();
        cache.flush(FlushScope::Page(b)).unwrap();
        assert!(store.raw_page(b).is_some());
        assert!(store.raw_page(a).is_none());
    }

    #[test]
    fn test_missing_page() {
        let (_, cache) = cache();
        assert!(matches!(cache.read(9, |_| ()), Err(TxError::PageMissing(9))));
    }

    #[test]
    fn test_write_failure_keeps_dirty() {
        let (store, cache) = cache();
        let page = cache.allocate().unwrap();
        store.inject_write_failure(true);
        assert!(cache.flush(FlushScope::All).is_err());
        assert_eq!(cache.dirty_pages(), 1);
        store.inject_write_failure(false);
        cache.flush(FlushScope::All).unwrap();
        assert!(store.raw_page(page).is_some());
    }

    #[test]
    fn test_reload_after_invalidate() {
        let (_, cache) = cache();
        let page = cache.allocate().unwrap();
        cache.write(page, |d| d[1] = 5).unwrap();
        cache.flush(FlushScope::All).unwrap();
        cache.invalidate(page);
        assert_eq!(cache.read(page, |d| d[1]).unwrap(), 5);
        assert_eq!(cache.stats().misses, 1);
    }
}

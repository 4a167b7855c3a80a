use super::{PageNumber, PageStore};
use crate::error::{TxError, TxResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// 内存页存储
///
/// 用于测试：可注入读写故障，多个数据库实例可以共享同一个存储来模拟崩溃重启。
pub struct MemPageStore {
    pages: Mutex<BTreeMap<PageNumber, Vec<u8>>>,
    meta: Mutex<HashMap<String, Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    page_writes: AtomicU64,
    syncs: AtomicU64,
}

impl MemPageStore {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(BTreeMap::new()),
            meta: Mutex::new(HashMap::new()),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            page_writes: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        }
    }

    /// 之后的页读取全部失败
    pub fn inject_read_failure(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// 之后的页写入全部失败
    pub fn inject_write_failure(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// 累计页写入次数
    pub fn page_writes(&self) -> u64 {
        self.page_writes.load(Ordering::Relaxed)
    }

    pub fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    /// 直接查看已落盘的页内容
    pub fn raw_page(&self, page: PageNumber) -> Option<Vec<u8>> {
        self.pages.lock().get(&page).cloned()
    }

    fn injected(what: &str) -> TxError {
        TxError::Io(io::Error::new(io::ErrorKind::Other, format!("injected {} failure", what)))
    }
}

impl Default for MemPageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PageStore for MemPageStore {
    fn read_page(&self, page: PageNumber) -> TxResult<Option<Vec<u8>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::injected("read"));
        }
        Ok(self.pages.lock().get(&page).cloned())
    }

    fn write_page(&self, page: PageNumber, data: &[u8]) -> TxResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected("write"));
        }
        self.pages.lock().insert(page, data.to_vec());
        self.page_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn page_count(&self) -> TxResult<PageNumber> {
        Ok(self
            .pages
            .lock()
            .keys()
            .next_back()
            .map(|p| p + 1)
            .unwrap_or(0))
    }

    fn sync(&self) -> TxResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected("sync"));
        }
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_meta(&self, key: &str) -> TxResult<Option<Vec<u8>>> {
        Ok(self.meta.lock().get(key).cloned())
    }

    fn write_meta(&self, key: &str, value: &[u8]) -> TxResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected("write"));
        }
        self.meta.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete_meta(&self, key: &str) -> TxResult<()> {
        self.meta.lock().remove(key);
        Ok(())
    }

    fn meta_keys(&self, prefix: &str) -> TxResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .meta
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

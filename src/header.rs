// 头页与全局水位线
//
// 水位线满足 OIT <= OAT <= OST <= Next。内存中的值只增不减，
// 头页按批预留事务号，每批只写一次头页。

use crate::error::{TxError, TxResult};
use crate::storage::{FlushScope, PageCache, PageNumber, HEADER_PAGE};
use crate::tip::TipStore;
use crate::transactions::TraNumber;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

pub const HEADER_PAGE_TYPE: u8 = 1;

/// 事务号上限，留出提交号的特殊值空间
pub const MAX_TRANSACTION_NUMBER: TraNumber = u64::MAX >> 1;

/// 头页布局（bincode 定长小端编码，字段偏移固定）
///
/// | 偏移 | 字段 |
/// |---|---|
/// | 0 | page_type: u8 |
/// | 1 | page_size: u32 |
/// | 5 | flags: u32 |
/// | 9 | next_transaction: u64 |
/// | 17 | oldest_transaction: u64 |
/// | 25 | oldest_active: u64 |
/// | 33 | oldest_snapshot: u64 |
/// | 41 | first_tip_page: u32 |
/// | 45 | transactions_per_page: u64 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPage {
    pub page_type: u8,
    pub page_size: u32,
    pub flags: u32,
    pub next_transaction: u64,
    pub oldest_transaction: u64,
    pub oldest_active: u64,
    pub oldest_snapshot: u64,
    pub first_tip_page: PageNumber,
    pub transactions_per_page: u64,
}

impl HeaderPage {
    pub fn new(page_size: usize, first_tip_page: PageNumber, transactions_per_page: u64) -> Self {
        Self {
            page_type: HEADER_PAGE_TYPE,
            page_size: page_size as u32,
            flags: 0,
            next_transaction: 1,
            oldest_transaction: 1,
            oldest_active: 1,
            oldest_snapshot: 1,
            first_tip_page,
            transactions_per_page,
        }
    }

    pub fn encode(&self) -> TxResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> TxResult<Self> {
        let header: Self = bincode::deserialize(data)?;
        if header.page_type != HEADER_PAGE_TYPE {
            return Err(TxError::CorruptPage {
                page: HEADER_PAGE,
                reason: format!("expected header page, found type {}", header.page_type),
            });
        }
        Ok(header)
    }
}

/// 水位线快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkSnapshot {
    pub next: TraNumber,
    pub oit: TraNumber,
    pub oat: TraNumber,
    pub ost: TraNumber,
}

impl WatermarkSnapshot {
    pub fn is_ordered(&self) -> bool {
        self.oit <= self.oat && self.oat <= self.ost && self.ost <= self.next
    }
}

/// 全局水位线
///
/// 显式持有，通过引用传给每个事务操作。
pub struct Watermarks {
    cache: Arc<PageCache>,
    header: Mutex<HeaderPage>,
    next: AtomicU64,
    oit: AtomicU64,
    oat: AtomicU64,
    ost: AtomicU64,
    /// 头页中已持久化的 next，内存中的 next 不会超过它
    reserved: AtomicU64,
    batch: u64,
    alloc_lock: Mutex<()>,
    advance_lock: Mutex<()>,
}

impl Watermarks {
    fn from_header(cache: Arc<PageCache>, header: HeaderPage, batch: u64) -> Self {
        Self {
            cache,
            next: AtomicU64::new(header.next_transaction),
            oit: AtomicU64::new(header.oldest_transaction),
            oat: AtomicU64::new(header.oldest_active),
            ost: AtomicU64::new(header.oldest_snapshot),
            reserved: AtomicU64::new(header.next_transaction),
            header: Mutex::new(header),
            batch,
            alloc_lock: Mutex::new(()),
            advance_lock: Mutex::new(()),
        }
    }

    /// 写入新数据库的头页（0 号页必须已分配）
    pub fn create(cache: Arc<PageCache>, header: HeaderPage, batch: u64) -> TxResult<Self> {
        let watermarks = Self::from_header(cache, header, batch);
        watermarks.write_header(header.next_transaction)?;
        Ok(watermarks)
    }

    /// 从头页加载
    pub fn load(cache: Arc<PageCache>, batch: u64) -> TxResult<(Self, HeaderPage)> {
        let header = cache.read(HEADER_PAGE, HeaderPage::decode)??;
        let snapshot = WatermarkSnapshot {
            next: header.next_transaction,
            oit: header.oldest_transaction,
            oat: header.oldest_active,
            ost: header.oldest_snapshot,
        };
        if !snapshot.is_ordered() {
            return Err(TxError::CorruptPage {
                page: HEADER_PAGE,
                reason: format!("watermarks out of order: {:?}", snapshot),
            });
        }
        Ok((Self::from_header(cache, header, batch), header))
    }

    fn write_header(&self, next: TraNumber) -> TxResult<()> {
        let mut header = self.header.lock();
        let mut image = *header;
        image.next_transaction = next;
        image.oldest_transaction = self.oit.load(Ordering::SeqCst);
        image.oldest_active = self.oat.load(Ordering::SeqCst);
        image.oldest_snapshot = self.ost.load(Ordering::SeqCst);
        let bytes = image.encode()?;
        self.cache
            .write(HEADER_PAGE, |data| data[..bytes.len()].copy_from_slice(&bytes))?;
        self.cache.flush(FlushScope::Page(HEADER_PAGE))?;
        *header = image;
        trace!(next, "header page written");
        Ok(())
    }

    /// 分配下一个事务号
    ///
    /// 跨越页边界时扩展 TIP；`on_allocate` 在同一临界区内执行，
    /// 用于获取新事务的存活锁。
    pub fn allocate_next<T>(
        &self,
        tip: &TipStore,
        on_allocate: impl FnOnce(TraNumber) -> TxResult<T>,
    ) -> TxResult<(TraNumber, T)> {
        let _guard = self.alloc_lock.lock();
        let number = self.next.load(Ordering::SeqCst);
        let oit = self.oit.load(Ordering::SeqCst);
        let oat = self.oat.load(Ordering::SeqCst);
        if oit > number || oat > number {
            return Err(TxError::consistency(format!(
                "watermarks ahead of next transaction: oit {} oat {} next {}",
                oit, oat, number
            )));
        }
        if number >= MAX_TRANSACTION_NUMBER {
            return Err(TxError::consistency("transaction number space exhausted"));
        }

        tip.extend_if_needed(number)?;
        if number >= self.reserved.load(Ordering::SeqCst) {
            let reserved = number + self.batch;
            self.write_header(reserved)?;
            self.reserved.store(reserved, Ordering::SeqCst);
            debug!(reserved, "reserved transaction number batch");
        }
        self.next.store(number + 1, Ordering::SeqCst);

        let extra = on_allocate(number)?;
        Ok((number, extra))
    }

    /// 推进水位线，只升不降
    pub fn advance(
        &self,
        oit: Option<TraNumber>,
        oat: Option<TraNumber>,
        ost: Option<TraNumber>,
    ) -> TxResult<WatermarkSnapshot> {
        let _guard = self.advance_lock.lock();
        let merged = WatermarkSnapshot {
            oit: oit.map_or(self.oit.load(Ordering::SeqCst), |v| {
                self.oit.load(Ordering::SeqCst).max(v)
            }),
            oat: oat.map_or(self.oat.load(Ordering::SeqCst), |v| {
                self.oat.load(Ordering::SeqCst).max(v)
            }),
            ost: ost.map_or(self.ost.load(Ordering::SeqCst), |v| {
                self.ost.load(Ordering::SeqCst).max(v)
            }),
            next: self.next.load(Ordering::SeqCst),
        };
        if !merged.is_ordered() {
            return Err(TxError::consistency(format!(
                "watermark order violated: {:?}",
                merged
            )));
        }
        self.oit.store(merged.oit, Ordering::SeqCst);
        self.oat.store(merged.oat, Ordering::SeqCst);
        self.ost.store(merged.ost, Ordering::SeqCst);
        Ok(merged)
    }

    pub fn read_snapshot(&self) -> WatermarkSnapshot {
        let _guard = self.advance_lock.lock();
        WatermarkSnapshot {
            oit: self.oit.load(Ordering::SeqCst),
            oat: self.oat.load(Ordering::SeqCst),
            ost: self.ost.load(Ordering::SeqCst),
            next: self.next.load(Ordering::SeqCst),
        }
    }

    pub fn next(&self) -> TraNumber {
        self.next.load(Ordering::SeqCst)
    }

    pub fn oldest_active(&self) -> TraNumber {
        self.oat.load(Ordering::SeqCst)
    }

    /// 持久化当前水位线，保留已预留的事务号
    pub fn flush(&self) -> TxResult<()> {
        let _guard = self.alloc_lock.lock();
        self.write_header(self.reserved.load(Ordering::SeqCst))
    }

    /// 正常关闭：头页记录确切的 next
    pub fn close(&self) -> TxResult<()> {
        let _guard = self.alloc_lock.lock();
        let next = self.next.load(Ordering::SeqCst);
        self.write_header(next)?;
        self.reserved.store(next, Ordering::SeqCst);
        Ok(())
    }

    pub fn header(&self) -> HeaderPage {
        *self.header.lock()
    }
}

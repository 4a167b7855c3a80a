// 数据库
//
// 把页存储、页缓存、头页水位线、TIP、状态缓存、锁管理器和清扫调度组装在一起。
// 所有共享状态集中在 DatabaseShared 中，由连接通过 Arc 持有。

use crate::attachment::Attachment;
use crate::config::EngineConfig;
use crate::error::{TxError, TxResult};
use crate::header::{HeaderPage, WatermarkSnapshot, Watermarks};
use crate::lock::{LockKey, LockLevel, LockManager, LockStats, LockWait};
use crate::storage::{
    FlushScope, MemPageStore, PageCache, PageCacheStats, PageStore, SledPageStore, HEADER_PAGE,
};
use crate::sweep::{run_sweep, GarbageCollector, SweepCheckpoint, SweepReport, SweepScheduler, SweepTrigger};
use crate::tip::{TipLayout, TipStore, WriteHint};
use crate::tpc::{CommitNumber, StateMask, TipCache, TpcStatsSnapshot};
use crate::transactions::{
    MemCatalog, RelationCatalog, ResourceRef, TraLockTracker, TraNumber, TraState, SYSTEM_TRANSACTION,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const LIMBO_PREFIX: &str = "limbo.";

/// limbo 事务描述的元数据键
pub(crate) fn limbo_key(number: TraNumber) -> String {
    format!("{}{:020}", LIMBO_PREFIX, number)
}

/// 数据库共享状态
pub struct DatabaseShared {
    config: EngineConfig,
    store: Arc<dyn PageStore>,
    cache: Arc<PageCache>,
    watermarks: Watermarks,
    tip: Arc<TipStore>,
    tpc: TipCache,
    locks: Arc<LockManager>,
    tracker: TraLockTracker,
    catalog: RwLock<Arc<dyn RelationCatalog>>,
    collector: RwLock<Option<Arc<dyn GarbageCollector>>>,
    sweep: SweepTrigger,
    live: AtomicUsize,
    started: AtomicU64,
    next_attachment: AtomicU64,
    shut_down: AtomicBool,
}

impl DatabaseShared {
    fn new(
        config: EngineConfig,
        store: Arc<dyn PageStore>,
        cache: Arc<PageCache>,
        watermarks: Watermarks,
        tip: Arc<TipStore>,
        tpc: TipCache,
    ) -> Self {
        let locks = Arc::new(LockManager::new(config.deadlock_detection));
        let tracker = TraLockTracker::new(locks.clone());
        let sweep = SweepTrigger::new(config.sweep_interval);
        Self {
            config,
            store,
            cache,
            watermarks,
            tip,
            tpc,
            locks,
            tracker,
            catalog: RwLock::new(Arc::new(MemCatalog::new())),
            collector: RwLock::new(None),
            sweep,
            live: AtomicUsize::new(0),
            started: AtomicU64::new(0),
            next_attachment: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn check_open(&self) -> TxResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TxError::Shutdown);
        }
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> Arc<dyn RelationCatalog> {
        self.catalog.read().clone()
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn tracker(&self) -> &TraLockTracker {
        &self.tracker
    }

    pub fn watermarks(&self) -> &Watermarks {
        &self.watermarks
    }

    pub fn tip(&self) -> &Arc<TipStore> {
        &self.tip
    }

    pub fn tpc(&self) -> &TipCache {
        &self.tpc
    }

    pub fn sweep_trigger(&self) -> &SweepTrigger {
        &self.sweep
    }

    pub fn page_cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    pub fn garbage_collector(&self) -> Option<Arc<dyn GarbageCollector>> {
        self.collector.read().clone()
    }

    pub(crate) fn transaction_started(&self) {
        self.live.fetch_add(1, Ordering::Relaxed);
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transaction_released(&self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn next_attachment_id(&self) -> u64 {
        self.next_attachment.fetch_add(1, Ordering::Relaxed)
    }

    /// 当前未释放的事务数
    pub fn live_transactions(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

/// 监控快照
#[derive(Debug, Clone)]
pub struct MonitorSnapshot {
    pub watermarks: WatermarkSnapshot,
    pub latest_commit_number: CommitNumber,
    /// 仍被快照引用的最小提交号，低于它的版本可做中间垃圾回收
    pub oldest_snapshot_number: CommitNumber,
    pub live_transactions: usize,
    pub started_transactions: u64,
    pub active_snapshots: usize,
    pub tip_pages: usize,
    pub cached_blocks: usize,
    pub tpc: TpcStatsSnapshot,
    pub locks: LockStats,
    pub page_cache: PageCacheStats,
    pub sweep_requests: u64,
    pub sweeps_completed: u64,
    pub taken_at: DateTime<Utc>,
}

/// 数据库实例
pub struct Database {
    shared: Arc<DatabaseShared>,
    scheduler: Option<SweepScheduler>,
}

impl Database {
    /// 在空存储上创建新数据库
    pub fn create(store: Arc<dyn PageStore>, config: EngineConfig) -> TxResult<Self> {
        config.validate()?;
        if store.page_count()? > 0 {
            return Err(TxError::InvalidConfig(
                "store already contains a database".into(),
            ));
        }
        let tpp = config.transactions_per_page();
        let cache = Arc::new(PageCache::new(store.clone(), config.page_size)?);
        let header_page = cache.allocate()?;
        if header_page != HEADER_PAGE {
            return Err(TxError::consistency(format!(
                "header allocated at page {}",
                header_page
            )));
        }
        let tip = Arc::new(TipStore::init(cache.clone(), TipLayout::new(tpp))?);
        // 0 号系统事务永远是已提交的
        tip.set_state(SYSTEM_TRANSACTION, TraState::Committed, WriteHint::Force)?;
        let header = HeaderPage::new(config.page_size, tip.first_page(), tpp);
        let watermarks = Watermarks::create(cache.clone(), header, config.header_batch)?;
        cache.flush(FlushScope::All)?;

        let tpc = TipCache::new(tip.clone(), header.oldest_transaction);
        info!(
            page_size = config.page_size,
            transactions_per_page = tpp,
            "database created"
        );
        Self::start(DatabaseShared::new(config, store, cache, watermarks, tip, tpc))
    }

    /// 打开已有数据库
    ///
    /// 页大小和每页事务数以头页为准。头页中的 next 是上次预留的批次上界，
    /// 预留区间中未使用的事务号在磁盘上仍为 Active，之后按需被判定为 Dead。
    pub fn open(store: Arc<dyn PageStore>, mut config: EngineConfig) -> TxResult<Self> {
        let raw = store
            .read_page(HEADER_PAGE)?
            .ok_or(TxError::PageMissing(HEADER_PAGE))?;
        let on_disk = HeaderPage::decode(&raw)?;
        if on_disk.page_size as usize != config.page_size
            || Some(on_disk.transactions_per_page) != config.transactions_per_page
        {
            debug!(
                page_size = on_disk.page_size,
                transactions_per_page = on_disk.transactions_per_page,
                "using page layout from header"
            );
        }
        config.page_size = on_disk.page_size as usize;
        config.transactions_per_page = Some(on_disk.transactions_per_page);
        config.validate()?;

        let cache = Arc::new(PageCache::new(store.clone(), config.page_size)?);
        let (watermarks, header) = Watermarks::load(cache.clone(), config.header_batch)?;
        let tip = Arc::new(TipStore::open(
            cache.clone(),
            TipLayout::new(header.transactions_per_page),
            header.first_tip_page,
        )?);
        tip.extend_if_needed(header.next_transaction.saturating_sub(1))?;
        let tpc = TipCache::new(tip.clone(), header.oldest_transaction);
        info!(
            next = header.next_transaction,
            oit = header.oldest_transaction,
            oat = header.oldest_active,
            tip_pages = tip.page_count(),
            "database opened"
        );
        Self::start(DatabaseShared::new(config, store, cache, watermarks, tip, tpc))
    }

    fn start(shared: DatabaseShared) -> TxResult<Self> {
        let shared = Arc::new(shared);
        let scheduler = if shared.config.sweep_interval > 0 {
            let (scheduler, sender) = SweepScheduler::spawn(Arc::downgrade(&shared))?;
            shared.sweep.attach(sender);
            Some(scheduler)
        } else {
            None
        };
        Ok(Self { shared, scheduler })
    }

    /// 内存数据库
    pub fn create_in_memory(config: EngineConfig) -> TxResult<Self> {
        Self::create(Arc::new(MemPageStore::new()), config)
    }

    /// 打开 sled 目录中的数据库，不存在时创建
    pub fn open_sled<P: AsRef<Path>>(path: P, config: EngineConfig) -> TxResult<Self> {
        let store: Arc<dyn PageStore> = Arc::new(SledPageStore::new(path)?);
        if store.page_count()? == 0 {
            Self::create(store, config)
        } else {
            Self::open(store, config)
        }
    }

    pub fn shared(&self) -> &Arc<DatabaseShared> {
        &self.shared
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// 新建连接
    pub fn attach(&self) -> TxResult<Attachment> {
        self.shared.check_open()?;
        Ok(Attachment::new(self.shared.clone()))
    }

    pub fn set_catalog(&self, catalog: Arc<dyn RelationCatalog>) {
        *self.shared.catalog.write() = catalog;
    }

    pub fn set_garbage_collector(&self, collector: Arc<dyn GarbageCollector>) {
        *self.shared.collector.write() = Some(collector);
    }

    pub fn watermarks(&self) -> WatermarkSnapshot {
        self.shared.watermarks.read_snapshot()
    }

    pub fn tip_page_count(&self) -> usize {
        self.shared.tip.page_count()
    }

    /// 事务在状态缓存中的状态
    pub fn transaction_state(&self, number: TraNumber) -> TxResult<TraState> {
        if number >= self.shared.watermarks.next() {
            return Err(TxError::UnknownTransaction(number));
        }
        self.shared.tpc.cache_state(number)
    }

    /// 直接读取 TIP 页上的状态
    pub fn tip_state(&self, number: TraNumber) -> TxResult<TraState> {
        if number >= self.shared.watermarks.next() {
            return Err(TxError::UnknownTransaction(number));
        }
        self.shared.tip.get_state(number)
    }

    pub fn monitor(&self) -> MonitorSnapshot {
        let shared = &self.shared;
        MonitorSnapshot {
            watermarks: shared.watermarks.read_snapshot(),
            latest_commit_number: shared.tpc.latest_commit_number(),
            oldest_snapshot_number: shared.tpc.oldest_snapshot_number(),
            live_transactions: shared.live_transactions(),
            started_transactions: shared.started.load(Ordering::Relaxed),
            active_snapshots: shared.tpc.active_snapshots(),
            tip_pages: shared.tip.page_count(),
            cached_blocks: shared.tpc.cached_blocks(),
            tpc: shared.tpc.stats(),
            locks: shared.locks.stats(),
            page_cache: shared.cache.stats(),
            sweep_requests: shared.sweep.requests(),
            sweeps_completed: self.scheduler.as_ref().map_or(0, SweepScheduler::completed),
            taken_at: Utc::now(),
        }
    }

    /// 手动清扫；已有清扫在运行时返回 None
    pub fn sweep(&self, checkpoint: &SweepCheckpoint) -> TxResult<Option<SweepReport>> {
        self.shared.check_open()?;
        run_sweep(&self.shared, checkpoint)
    }

    /// 删除元数据对象前检查没有事务固定它
    pub fn drop_resource(&self, resource: &ResourceRef) -> TxResult<()> {
        self.shared.check_open()?;
        let locks = &self.shared.locks;
        let owner = locks.new_owner();
        let lock = locks
            .lock(
                owner,
                LockKey::existence(resource.kind, resource.id),
                LockLevel::Exclusive,
                LockWait::NoWait,
            )
            .map_err(|err| match err {
                TxError::LockConflict(_) => TxError::ResourceInUse(resource.to_string()),
                other => other,
            })?;
        locks.release(lock);
        debug!(%resource, "resource dropped");
        Ok(())
    }

    /// 所有处于 limbo 的事务
    pub fn limbo_transactions(&self) -> TxResult<Vec<TraNumber>> {
        let header = self.shared.watermarks.read_snapshot();
        let mut found = Vec::new();
        let mut cursor = header.oit;
        while let Some(number) =
            self.shared
                .tpc
                .find_first_in_range(cursor, header.next, StateMask::LIMBO)?
        {
            found.push(number);
            cursor = number + 1;
        }
        Ok(found)
    }

    /// prepare 时写入的事务描述
    pub fn limbo_description(&self, number: TraNumber) -> TxResult<Option<Vec<u8>>> {
        self.shared.store.read_meta(&limbo_key(number))
    }

    /// 关闭数据库：停止后台清扫，写回脏页，头页记录确切的 next
    pub fn shutdown(&mut self) -> TxResult<()> {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.sweep.detach();
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
        let live = self.shared.live_transactions();
        if live > 0 {
            warn!(live, "shutting down with live transactions");
        }
        self.shared.cache.flush(FlushScope::All)?;
        self.shared.watermarks.close()?;
        info!(next = self.shared.watermarks.next(), "database shut down");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "database shutdown failed");
        }
    }
}

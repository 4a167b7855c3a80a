//! 引擎配置模块
//!
//! 定义页大小、TIP 容量、头页批量分配、清扫阈值和锁等待等配置项

use crate::error::{TxError, TxResult};
use crate::tip::TIP_HEADER_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 最小页大小
pub const MIN_PAGE_SIZE: usize = 256;
/// 最大页大小
pub const MAX_PAGE_SIZE: usize = 65536;

/// 引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 页大小（字节）
    pub page_size: usize,

    /// 每个 TIP 页容纳的事务数；为空时按页大小计算
    pub transactions_per_page: Option<u64>,

    /// 每次写头页预留的事务号数量
    pub header_batch: u64,

    /// OAT 与 OIT 的差距超过该值时触发自动清扫，0 表示关闭
    pub sweep_interval: u64,

    /// 清扫时每访问多少个事务号检查一次取消
    pub sweep_checkpoint_interval: u64,

    /// 默认锁等待上限（毫秒），0 表示无限等待
    pub lock_timeout_ms: u64,

    /// 所有读已提交事务强制使用语句级读一致性
    pub read_consistency: bool,

    /// 是否启用死锁检测
    pub deadlock_detection: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            transactions_per_page: None,
            header_batch: 32,
            sweep_interval: 20_000,
            sweep_checkpoint_interval: 1024,
            lock_timeout_ms: 10_000,
            read_consistency: false,
            deadlock_detection: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 高并发配置：更大的头页批量，减少头页写入
    pub fn high_concurrency() -> Self {
        Self {
            header_batch: 1024,
            page_size: 16384,
            ..Default::default()
        }
    }

    /// 小页配置，便于观察 TIP 页扩展
    pub fn small_pages(transactions_per_page: u64) -> Self {
        Self {
            page_size: MIN_PAGE_SIZE,
            transactions_per_page: Some(transactions_per_page),
            ..Default::default()
        }
    }

    /// 从 JSON 字符串加载
    pub fn from_json_str(json: &str) -> TxResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 文件加载
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> TxResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_transactions_per_page(mut self, tpp: u64) -> Self {
        self.transactions_per_page = Some(tpp);
        self
    }

    pub fn with_header_batch(mut self, batch: u64) -> Self {
        self.header_batch = batch;
        self
    }

    pub fn with_sweep_interval(mut self, interval: u64) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_sweep_checkpoint_interval(mut self, interval: u64) -> Self {
        self.sweep_checkpoint_interval = interval;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_read_consistency(mut self, enable: bool) -> Self {
        self.read_consistency = enable;
        self
    }

    pub fn with_deadlock_detection(mut self, enable: bool) -> Self {
        self.deadlock_detection = enable;
        self
    }

    /// 一个 TIP 页最多能容纳的事务数
    pub fn max_transactions_per_page(&self) -> u64 {
        (self.page_size.saturating_sub(TIP_HEADER_SIZE) as u64) * 4
    }

    /// 实际使用的每页事务数
    pub fn transactions_per_page(&self) -> u64 {
        self.transactions_per_page
            .unwrap_or_else(|| self.max_transactions_per_page())
    }

    /// 默认锁等待上限
    pub fn lock_timeout(&self) -> Option<Duration> {
        (self.lock_timeout_ms > 0).then(|| Duration::from_millis(self.lock_timeout_ms))
    }

    /// 校验配置
    pub fn validate(&self) -> TxResult<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(TxError::InvalidConfig(format!(
                "page_size {} outside {}..={}",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        let tpp = self.transactions_per_page();
        if tpp == 0 || tpp > self.max_transactions_per_page() {
            return Err(TxError::InvalidConfig(format!(
                "transactions_per_page {} does not fit a {} byte page",
                tpp, self.page_size
            )));
        }
        if tpp % 4 != 0 {
            return Err(TxError::InvalidConfig(format!(
                "transactions_per_page {} must be a multiple of 4",
                tpp
            )));
        }
        if self.header_batch == 0 {
            return Err(TxError::InvalidConfig("header_batch must be positive".into()));
        }
        if self.sweep_checkpoint_interval == 0 {
            return Err(TxError::InvalidConfig(
                "sweep_checkpoint_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

// 后台清扫调度
//
// 独立的 tokio 运行时上运行一个后台任务：
// - 从 mpsc 通道接收清扫请求（容量 1，重复请求被合并）
// - 清扫本身在 spawn_blocking 中执行
// - watch 通道作为关闭信号，关闭时同时取消正在进行的清扫

use super::{run_sweep, SweepCheckpoint, SweepReport};
use crate::database::DatabaseShared;
use crate::error::TxResult;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// 后台清扫调度器
pub struct SweepScheduler {
    runtime: Option<Runtime>,
    shutdown: watch::Sender<bool>,
    checkpoint: SweepCheckpoint,
    completed: Arc<AtomicU64>,
    last_report: Arc<Mutex<Option<SweepReport>>>,
}

impl SweepScheduler {
    /// 启动后台任务，返回调度器和请求发送端
    pub fn spawn(db: Weak<DatabaseShared>) -> TxResult<(Self, mpsc::Sender<()>)> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("txdb-sweep")
            .enable_all()
            .build()?;
        let (request_tx, mut request_rx) = mpsc::channel::<()>(1);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let checkpoint = SweepCheckpoint::new();
        let completed = Arc::new(AtomicU64::new(0));
        let last_report = Arc::new(Mutex::new(None));

        {
            let checkpoint = checkpoint.clone();
            let completed = completed.clone();
            let last_report = last_report.clone();
            runtime.spawn(async move {
                loop {
                    tokio::select! {
                        request = request_rx.recv() => {
                            if request.is_none() {
                                break;
                            }
                            let Some(db) = db.upgrade() else {
                                break;
                            };
                            let checkpoint = checkpoint.clone();
                            let result =
                                tokio::task::spawn_blocking(move || run_sweep(&db, &checkpoint)).await;
                            match result {
                                Ok(Ok(Some(report))) => {
                                    completed.fetch_add(1, Ordering::Relaxed);
                                    *last_report.lock() = Some(report);
                                }
                                Ok(Ok(None)) => debug!("background sweep skipped"),
                                Ok(Err(err)) => warn!(error = %err, "background sweep failed"),
                                Err(err) => warn!(error = %err, "background sweep task aborted"),
                            }
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
                debug!("sweep worker stopped");
            });
        }

        info!("sweep scheduler started");
        Ok((
            Self {
                runtime: Some(runtime),
                shutdown: shutdown_tx,
                checkpoint,
                completed,
                last_report,
            },
            request_tx,
        ))
    }

    /// 已完成的后台清扫次数
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn last_report(&self) -> Option<SweepReport> {
        self.last_report.lock().clone()
    }

    /// 停止后台任务，取消正在进行的清扫
    pub fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        self.checkpoint.cancel();
        let _ = self.shutdown.send(true);
        runtime.shutdown_timeout(Duration::from_secs(5));
        info!("sweep scheduler stopped");
    }
}

impl Drop for SweepScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// 保存点栈
//
// 每个保存点持有自己的撤销日志。回滚保存点时按逆序执行撤销动作，
// 释放保存点时把撤销日志并入上一层。

use crate::error::{TxError, TxResult};
use std::fmt;

/// 撤销动作
pub trait UndoAction: Send {
    /// 撤销一次修改
    fn undo(self: Box<Self>) -> TxResult<()>;
}

impl<F> UndoAction for F
where
    F: FnOnce() -> TxResult<()> + Send,
{
    fn undo(self: Box<Self>) -> TxResult<()> {
        (*self)()
    }
}

/// 保存点句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SavepointHandle(u64);

impl fmt::Display for SavepointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct SavepointFrame {
    handle: SavepointHandle,
    name: Option<String>,
    undo_log: Vec<Box<dyn UndoAction>>,
}

/// 保存点栈
pub struct SavepointStack {
    frames: Vec<SavepointFrame>,
    next_id: u64,
}

impl SavepointStack {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            next_id: 1,
        }
    }

    /// 开始一个保存点
    pub fn start(&mut self, name: Option<&str>) -> SavepointHandle {
        let handle = SavepointHandle(self.next_id);
        self.next_id += 1;
        self.frames.push(SavepointFrame {
            handle,
            name: name.map(str::to_string),
            undo_log: Vec::new(),
        });
        handle
    }

    fn position(&self, handle: SavepointHandle) -> TxResult<usize> {
        match self.frames.iter().position(|f| f.handle == handle) {
            Some(index) => Ok(index),
            // 曾经发出过的句柄再次释放属于内部错误
            None if handle.0 < self.next_id => Err(TxError::consistency(format!(
                "savepoint {} was already released",
                handle
            ))),
            None => Err(TxError::SavepointNotFound(handle.to_string())),
        }
    }

    /// 按名称查找最近的保存点
    pub fn find(&self, name: &str) -> Option<SavepointHandle> {
        self.frames
            .iter()
            .rev()
            .find(|f| f.name.as_deref() == Some(name))
            .map(|f| f.handle)
    }

    /// 记录一个撤销动作；没有保存点时丢弃
    pub fn post_undo(&mut self, action: Box<dyn UndoAction>) {
        if let Some(frame) = self.frames.last_mut() {
            frame.undo_log.push(action);
        }
    }

    fn undo_frame(frame: SavepointFrame) -> TxResult<()> {
        for action in frame.undo_log.into_iter().rev() {
            action.undo()?;
        }
        Ok(())
    }

    /// 回滚到保存点（含）之后的所有修改，并移除这些保存点
    pub fn rollback(&mut self, handle: SavepointHandle) -> TxResult<()> {
        let index = self.position(handle)?;
        while self.frames.len() > index {
            if let Some(frame) = self.frames.pop() {
                Self::undo_frame(frame)?;
            }
        }
        Ok(())
    }

    /// 释放保存点（及其之上的保存点），撤销日志并入上一层
    pub fn release(&mut self, handle: SavepointHandle) -> TxResult<()> {
        let index = self.position(handle)?;
        let released: Vec<SavepointFrame> = self.frames.drain(index..).collect();
        if let Some(parent) = self.frames.last_mut() {
            for frame in released {
                parent.undo_log.extend(frame.undo_log);
            }
        }
        Ok(())
    }

    /// 释放除最底层以外的所有保存点
    pub fn release_to_root(&mut self) {
        if self.frames.len() > 1 {
            let released: Vec<SavepointFrame> = self.frames.drain(1..).collect();
            for frame in released {
                self.frames[0].undo_log.extend(frame.undo_log);
            }
        }
    }

    /// 提交：释放全部保存点，撤销日志不再需要
    pub fn release_all(&mut self) {
        self.frames.clear();
    }

    /// 逐层撤销全部保存点，任何失败立即返回
    pub fn rollback_all(&mut self) -> TxResult<()> {
        while let Some(frame) = self.frames.pop() {
            Self::undo_frame(frame)?;
        }
        Ok(())
    }

    /// 丢弃全部保存点而不执行撤销
    pub fn discard_all(&mut self) {
        self.frames.clear();
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// 所有保存点中的撤销动作数
    pub fn undo_count(&self) -> usize {
        self.frames.iter().map(|f| f.undo_log.len()).sum()
    }
}

impl Default for SavepointStack {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SavepointStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SavepointStack")
            .field("depth", &self.frames.len())
            .field("undo_actions", &self.undo_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder(log: &Arc<Mutex<Vec<u32>>>, value: u32) -> Box<dyn UndoAction> {
        let log = log.clone();
        Box::new(move || -> TxResult<()> {
            log.lock().push(value);
            Ok(())
        })
    }

    #[test]
    fn test_rollback_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = SavepointStack::new();
        stack.start(None);
        stack.post_undo(recorder(&log, 1));
        let sp = stack.start(Some("inner"));
        stack.post_undo(recorder(&log, 2));
        stack.post_undo(recorder(&log, 3));

        stack.rollback(sp).unwrap();
        assert_eq!(*log.lock(), vec![3, 2]);
        assert_eq!(stack.depth(), 1);

        stack.rollback_all().unwrap();
        assert_eq!(*log.lock(), vec![3, 2, 1]);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_release_folds_into_parent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = SavepointStack::new();
        let root = stack.start(None);
        let sp = stack.start(Some("a"));
        stack.post_undo(recorder(&log, 7));
        stack.release(sp).unwrap();
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.undo_count(), 1);
        stack.rollback(root).unwrap();
        assert_eq!(*log.lock(), vec![7]);
    }

    #[test]
    fn test_double_release_is_consistency_error() {
        let mut stack = SavepointStack::new();
        stack.start(None);
        let sp = stack.start(Some("a"));
        stack.release(sp).unwrap();
        assert!(stack.release(sp).unwrap_err().is_fatal());
        assert!(matches!(
            stack.release(SavepointHandle(99)),
            Err(TxError::SavepointNotFound(_))
        ));
    }

    #[test]
    fn test_find_by_name() {
        let mut stack = SavepointStack::new();
        stack.start(None);
        let a = stack.start(Some("a"));
        assert_eq!(stack.find("a"), Some(a));
        assert_eq!(stack.find("b"), None);
    }

    #[test]
    fn test_undo_failure_propagates() {
        let mut stack = SavepointStack::new();
        stack.start(None);
        stack.post_undo(Box::new(|| -> TxResult<()> {
            Err(TxError::Cancelled("undo".into()))
        }));
        assert!(stack.rollback_all().is_err());
    }

    #[test]
    fn test_release_to_root() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = SavepointStack::new();
        stack.start(None);
        stack.start(Some("a"));
        stack.post_undo(recorder(&log, 1));
        stack.start(Some("b"));
        stack.release_to_root();
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.undo_count(), 1);
    }
}

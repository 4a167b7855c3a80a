// 事务资源
//
// 事务依赖的元数据对象（关系、存储过程、排序规则、函数）通过共享存在锁固定，
// 防止被并发删除；提交时执行的元数据延迟工作也在这里定义。

use super::TraNumber;
use crate::error::TxResult;
use crate::lock::LockId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 资源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Relation,
    Procedure,
    Collation,
    Function,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Relation => "relation",
            ResourceKind::Procedure => "procedure",
            ResourceKind::Collation => "collation",
            ResourceKind::Function => "function",
        };
        f.write_str(name)
    }
}

/// 资源引用
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: u64,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, id: u64, name: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            name: name.into(),
        }
    }

    pub fn relation(id: u64, name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Relation, id, name)
    }

    pub fn procedure(id: u64, name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Procedure, id, name)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

/// 提交时执行的延迟工作
///
/// `perform` 在状态写入之前执行，失败会中止提交且事务保持活动；
/// `post_commit` 在提交完成后执行。
pub trait DeferredWork: Send {
    fn name(&self) -> &str;

    fn perform(&mut self, number: TraNumber) -> TxResult<()>;

    fn post_commit(&mut self, _number: TraNumber) {}
}

/// 事务已登记的资源
#[derive(Debug, Default)]
pub struct PostedResources {
    entries: Vec<(ResourceRef, LockId)>,
}

impl PostedResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, resource: &ResourceRef) -> bool {
        self.entries
            .iter()
            .any(|(r, _)| r.kind == resource.kind && r.id == resource.id)
    }

    pub fn push(&mut self, resource: ResourceRef, lock: LockId) {
        self.entries.push((resource, lock));
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceRef> {
        self.entries.iter().map(|(r, _)| r)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 取出全部存在锁
    pub fn drain_locks(&mut self) -> Vec<LockId> {
        self.entries.drain(..).map(|(_, lock)| lock).collect()
    }
}

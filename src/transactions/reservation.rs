// 关系预留
//
// TPB 中的 lock_read / lock_write 项在事务启动时转换为关系锁。
// 视图递归展开为其基表，同一关系不能以不同的锁模式预留两次。

use super::tpb::{Reservation, ReserveAccess, ShareMode};
use super::IsolationMode;
use crate::error::{TxError, TxResult};
use crate::lock::LockLevel;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// 视图嵌套深度上限
pub const MAX_VIEW_DEPTH: usize = 30;

/// 关系类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationKind {
    Table,
    /// 视图及其引用的关系名
    View { bases: Vec<String> },
}

/// 关系元数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationInfo {
    pub id: u64,
    pub name: String,
    pub kind: RelationKind,
}

/// 关系目录
pub trait RelationCatalog: Send + Sync {
    fn lookup(&self, name: &str) -> Option<RelationInfo>;
}

/// 内存目录
#[derive(Debug)]
pub struct MemCatalog {
    relations: RwLock<HashMap<String, RelationInfo>>,
    next_id: AtomicU64,
}

impl MemCatalog {
    pub fn new() -> Self {
        Self {
            relations: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(128),
        }
    }

    fn add(&self, name: &str, kind: RelationKind) -> u64 {
        let mut relations = self.relations.write();
        if let Some(existing) = relations.get(name) {
            return existing.id;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        relations.insert(
            name.to_string(),
            RelationInfo {
                id,
                name: name.to_string(),
                kind,
            },
        );
        id
    }

    /// 登记基表，已存在时返回原有 id
    pub fn add_table(&self, name: &str) -> u64 {
        self.add(name, RelationKind::Table)
    }

    pub fn add_view(&self, name: &str, bases: &[&str]) -> u64 {
        self.add(
            name,
            RelationKind::View {
                bases: bases.iter().map(|b| b.to_string()).collect(),
            },
        )
    }

    pub fn remove(&self, name: &str) -> Option<RelationInfo> {
        self.relations.write().remove(name)
    }

    pub fn len(&self) -> usize {
        self.relations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.read().is_empty()
    }
}

impl Default for MemCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl RelationCatalog for MemCatalog {
    fn lookup(&self, name: &str) -> Option<RelationInfo> {
        self.relations.read().get(name).cloned()
    }
}

/// 展开后的基表预留
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedReservation {
    pub relation_id: u64,
    pub name: String,
    pub level: LockLevel,
}

fn reservation_level(access: ReserveAccess, share: ShareMode) -> LockLevel {
    match (access, share) {
        (_, ShareMode::Exclusive) => LockLevel::Exclusive,
        (ReserveAccess::Read, ShareMode::Shared) => LockLevel::SharedRead,
        (ReserveAccess::Write, ShareMode::Shared) => LockLevel::SharedWrite,
        (ReserveAccess::Read, ShareMode::Protected) => LockLevel::ProtectedRead,
        (ReserveAccess::Write, ShareMode::Protected) => LockLevel::ProtectedWrite,
    }
}

fn expand_one(
    catalog: &dyn RelationCatalog,
    name: &str,
    level: LockLevel,
    depth: usize,
    out: &mut Vec<ExpandedReservation>,
) -> TxResult<()> {
    let info = catalog
        .lookup(name)
        .ok_or_else(|| TxError::UnknownRelation(name.to_string()))?;

    match info.kind {
        RelationKind::Table => {
            if let Some(existing) = out.iter().find(|r| r.relation_id == info.id) {
                if existing.level != level {
                    return Err(TxError::ReservationConflict(info.name));
                }
                return Ok(());
            }
            out.push(ExpandedReservation {
                relation_id: info.id,
                name: info.name,
                level,
            });
            Ok(())
        }
        RelationKind::View { bases } => {
            if depth >= MAX_VIEW_DEPTH {
                return Err(TxError::ViewDepthExceeded(info.name));
            }
            for base in &bases {
                expand_one(catalog, base, level, depth + 1, out)?;
            }
            Ok(())
        }
    }
}

/// 把预留展开为基表锁请求
///
/// 未指定共享方式时，consistency 隔离级别使用 protected，其他使用 shared。
pub fn expand_reservations(
    catalog: &dyn RelationCatalog,
    reservations: &[Reservation],
    isolation: IsolationMode,
) -> TxResult<Vec<ExpandedReservation>> {
    let default_share = match isolation {
        IsolationMode::Consistency => ShareMode::Protected,
        _ => ShareMode::Shared,
    };
    let mut out = Vec::new();
    for reservation in reservations {
        let level = reservation_level(reservation.access, reservation.share.unwrap_or(default_share));
        expand_one(catalog, &reservation.relation, level, 0, &mut out)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserve(name: &str, access: ReserveAccess, share: Option<ShareMode>) -> Reservation {
        Reservation {
            relation: name.to_string(),
            access,
            share,
        }
    }

    #[test]
    fn test_levels() {
        let catalog = MemCatalog::new();
        catalog.add_table("A");
        let expanded = expand_reservations(
            &catalog,
            &[reserve("A", ReserveAccess::Write, None)],
            IsolationMode::Consistency,
        )
        .unwrap();
        assert_eq!(expanded[0].level, LockLevel::ProtectedWrite);

        let expanded = expand_reservations(
            &catalog,
            &[reserve("A", ReserveAccess::Read, None)],
            IsolationMode::Concurrency,
        )
        .unwrap();
        assert_eq!(expanded[0].level, LockLevel::SharedRead);
    }

    #[test]
    fn test_view_expands_to_bases() {
        let catalog = MemCatalog::new();
        let emp = catalog.add_table("EMP");
        let dept = catalog.add_table("DEPT");
        catalog.add_view("V1", &["EMP"]);
        catalog.add_view("V2", &["V1", "DEPT", "EMP"]);

        let expanded = expand_reservations(
            &catalog,
            &[reserve("V2", ReserveAccess::Read, Some(ShareMode::Protected))],
            IsolationMode::Concurrency,
        )
        .unwrap();
        let ids: Vec<u64> = expanded.iter().map(|r| r.relation_id).collect();
        assert_eq!(ids, vec![emp, dept]);
        assert!(expanded.iter().all(|r| r.level == LockLevel::ProtectedRead));
    }

    #[test]
    fn test_cyclic_view_rejected() {
        let catalog = MemCatalog::new();
        catalog.add_view("LOOP_A", &["LOOP_B"]);
        catalog.add_view("LOOP_B", &["LOOP_A"]);
        let err = expand_reservations(
            &catalog,
            &[reserve("LOOP_A", ReserveAccess::Read, None)],
            IsolationMode::Concurrency,
        )
        .unwrap_err();
        assert!(matches!(err, TxError::ViewDepthExceeded(_)));
    }

    #[test]
    fn test_conflicting_modes_rejected() {
        let catalog = MemCatalog::new();
        catalog.add_table("EMP");
        catalog.add_view("V", &["EMP"]);
        let err = expand_reservations(
            &catalog,
            &[
                reserve("EMP", ReserveAccess::Read, None),
                reserve("V", ReserveAccess::Write, None),
            ],
            IsolationMode::Concurrency,
        )
        .unwrap_err();
        assert!(matches!(err, TxError::ReservationConflict(name) if name == "EMP"));
    }

    #[test]
    fn test_unknown_relation() {
        let catalog = MemCatalog::new();
        assert!(matches!(
            expand_reservations(
                &catalog,
                &[reserve("NOPE", ReserveAccess::Read, None)],
                IsolationMode::Concurrency
            ),
            Err(TxError::UnknownRelation(_))
        ));
    }
}

// 事务参数块（TPB）
//
// 版本字节之后是一串标签项：
// - 单字节标志（隔离级别、访问方式、等待方式……）
// - lock_timeout：长度字节 + 1..4 字节小端整数
// - lock_read / lock_write：长度字节 + 关系名 + 可选的共享方式字节

use super::{IsolationMode, ReadCommittedMode};
use crate::error::{TxError, TxResult};
use crate::lock::LockWait;
use nom::{
    combinator::{opt, verify},
    multi::{length_data, many0},
    number::complete::le_u8,
    IResult,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 标识符最大字节数
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

pub const TPB_VERSION1: u8 = 1;
pub const TPB_VERSION3: u8 = 3;

pub const TPB_CONSISTENCY: u8 = 1;
pub const TPB_CONCURRENCY: u8 = 2;
pub const TPB_SHARED: u8 = 3;
pub const TPB_PROTECTED: u8 = 4;
pub const TPB_EXCLUSIVE: u8 = 5;
pub const TPB_WAIT: u8 = 6;
pub const TPB_NOWAIT: u8 = 7;
pub const TPB_READ: u8 = 8;
pub const TPB_WRITE: u8 = 9;
pub const TPB_LOCK_READ: u8 = 10;
pub const TPB_LOCK_WRITE: u8 = 11;
pub const TPB_IGNORE_LIMBO: u8 = 14;
pub const TPB_READ_COMMITTED: u8 = 15;
pub const TPB_AUTOCOMMIT: u8 = 16;
pub const TPB_REC_VERSION: u8 = 17;
pub const TPB_NO_REC_VERSION: u8 = 18;
pub const TPB_RESTART_REQUESTS: u8 = 19;
pub const TPB_NO_AUTO_UNDO: u8 = 20;
pub const TPB_LOCK_TIMEOUT: u8 = 21;
pub const TPB_READ_CONSISTENCY: u8 = 22;

/// 访问方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
}

/// 关系预留的访问方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReserveAccess {
    Read,
    Write,
}

/// 关系预留的共享方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShareMode {
    Shared,
    Protected,
    Exclusive,
}

/// 关系预留
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub relation: String,
    pub access: ReserveAccess,
    /// 未指定时由隔离级别决定
    pub share: Option<ShareMode>,
}

/// 事务选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOptions {
    pub isolation: IsolationMode,
    pub access: AccessMode,
    pub wait: bool,
    /// 显式锁超时，None 时使用配置的默认值
    pub lock_timeout: Option<Duration>,
    pub autocommit: bool,
    pub no_auto_undo: bool,
    pub ignore_limbo: bool,
    pub restart_requests: bool,
    pub reservations: Vec<Reservation>,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation: IsolationMode::Concurrency,
            access: AccessMode::ReadWrite,
            wait: true,
            lock_timeout: None,
            autocommit: false,
            no_auto_undo: false,
            ignore_limbo: false,
            restart_requests: false,
            reservations: Vec::new(),
        }
    }
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrency() -> Self {
        Self::default()
    }

    pub fn consistency() -> Self {
        Self {
            isolation: IsolationMode::Consistency,
            ..Self::default()
        }
    }

    pub fn read_committed(mode: ReadCommittedMode) -> Self {
        Self {
            isolation: IsolationMode::ReadCommitted(mode),
            ..Self::default()
        }
    }

    pub fn read_only(mut self) -> Self {
        self.access = AccessMode::ReadOnly;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.wait = false;
        self.lock_timeout = None;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.wait = true;
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn autocommit(mut self) -> Self {
        self.autocommit = true;
        self
    }

    pub fn no_auto_undo(mut self) -> Self {
        self.no_auto_undo = true;
        self
    }

    pub fn ignore_limbo(mut self) -> Self {
        self.ignore_limbo = true;
        self
    }

    pub fn restart_requests(mut self) -> Self {
        self.restart_requests = true;
        self
    }

    pub fn reserve(
        mut self,
        relation: impl Into<String>,
        access: ReserveAccess,
        share: Option<ShareMode>,
    ) -> Self {
        self.reservations.push(Reservation {
            relation: relation.into(),
            access,
            share,
        });
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.access == AccessMode::ReadOnly
    }

    /// 检查选项组合
    pub fn validate(&self) -> TxResult<()> {
        if !self.wait && self.lock_timeout.is_some() {
            return Err(TxError::OptionConflict(
                "lock timeout requires wait mode".into(),
            ));
        }
        for reservation in &self.reservations {
            check_identifier(&reservation.relation)?;
        }
        Ok(())
    }

    /// 锁等待方式；等待且未显式指定超时时使用 `default_timeout`
    pub fn lock_wait(&self, default_timeout: Option<Duration>) -> LockWait {
        if !self.wait {
            return LockWait::NoWait;
        }
        match self.lock_timeout.or(default_timeout) {
            Some(timeout) => LockWait::Timeout(timeout),
            None => LockWait::Wait,
        }
    }

    /// 编码为 TPB
    pub fn to_tpb(&self) -> Vec<u8> {
        let mut buf = vec![TPB_VERSION3];
        match self.isolation {
            IsolationMode::Concurrency => buf.push(TPB_CONCURRENCY),
            IsolationMode::Consistency => buf.push(TPB_CONSISTENCY),
            IsolationMode::ReadCommitted(mode) => {
                buf.push(TPB_READ_COMMITTED);
                buf.push(match mode {
                    ReadCommittedMode::RecordVersion => TPB_REC_VERSION,
                    ReadCommittedMode::NoRecordVersion => TPB_NO_REC_VERSION,
                    ReadCommittedMode::ReadConsistency => TPB_READ_CONSISTENCY,
                });
            }
        }
        buf.push(match self.access {
            AccessMode::ReadWrite => TPB_WRITE,
            AccessMode::ReadOnly => TPB_READ,
        });
        buf.push(if self.wait { TPB_WAIT } else { TPB_NOWAIT });
        if let Some(timeout) = self.lock_timeout {
            let secs = timeout.as_secs().min(u32::MAX as u64) as u32;
            buf.push(TPB_LOCK_TIMEOUT);
            buf.push(4);
            buf.extend_from_slice(&secs.to_le_bytes());
        }
        for (enabled, tag) in [
            (self.autocommit, TPB_AUTOCOMMIT),
            (self.no_auto_undo, TPB_NO_AUTO_UNDO),
            (self.ignore_limbo, TPB_IGNORE_LIMBO),
            (self.restart_requests, TPB_RESTART_REQUESTS),
        ] {
            if enabled {
                buf.push(tag);
            }
        }
        for reservation in &self.reservations {
            buf.push(match reservation.access {
                ReserveAccess::Read => TPB_LOCK_READ,
                ReserveAccess::Write => TPB_LOCK_WRITE,
            });
            let name = reservation.relation.as_bytes();
            buf.push(name.len().min(u8::MAX as usize) as u8);
            buf.extend_from_slice(&name[..name.len().min(u8::MAX as usize)]);
            if let Some(share) = reservation.share {
                buf.push(match share {
                    ShareMode::Shared => TPB_SHARED,
                    ShareMode::Protected => TPB_PROTECTED,
                    ShareMode::Exclusive => TPB_EXCLUSIVE,
                });
            }
        }
        buf
    }
}

fn check_identifier(name: &str) -> TxResult<()> {
    if name.is_empty() {
        return Err(TxError::InvalidTpb("empty relation name".into()));
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(TxError::IdentifierTooLong {
            name: name.to_string(),
            max: MAX_IDENTIFIER_LENGTH,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TpbItem<'a> {
    Flag(u8),
    LockTimeout(&'a [u8]),
    Reserve {
        tag: u8,
        name: &'a [u8],
        share: Option<u8>,
    },
}

fn share_byte(input: &[u8]) -> IResult<&[u8], u8> {
    verify(le_u8, |b: &u8| matches!(*b, TPB_SHARED | TPB_PROTECTED | TPB_EXCLUSIVE))(input)
}

fn item(input: &[u8]) -> IResult<&[u8], TpbItem<'_>> {
    let (input, tag) = le_u8(input)?;
    match tag {
        TPB_LOCK_READ | TPB_LOCK_WRITE => {
            let (input, name) = length_data(le_u8)(input)?;
            let (input, share) = opt(share_byte)(input)?;
            Ok((input, TpbItem::Reserve { tag, name, share }))
        }
        TPB_LOCK_TIMEOUT => {
            let (input, value) = length_data(le_u8)(input)?;
            Ok((input, TpbItem::LockTimeout(value)))
        }
        _ => Ok((input, TpbItem::Flag(tag))),
    }
}

fn items(input: &[u8]) -> IResult<&[u8], Vec<TpbItem<'_>>> {
    many0(item)(input)
}

/// 解析过程中的累积状态
#[derive(Default)]
struct TpbBuilder {
    isolation: Option<u8>,
    rc_mode: Option<u8>,
    access: Option<u8>,
    wait: Option<u8>,
    lock_timeout: Option<Duration>,
    seen: Vec<u8>,
    options: TransactionOptions,
}

impl TpbBuilder {
    fn set_once(slot: &mut Option<u8>, tag: u8, what: &str) -> TxResult<()> {
        match slot {
            Some(prev) if *prev == tag => Err(TxError::OptionConflict(format!(
                "{} specified more than once",
                what
            ))),
            Some(_) => Err(TxError::OptionConflict(format!(
                "conflicting {} options",
                what
            ))),
            None => {
                *slot = Some(tag);
                Ok(())
            }
        }
    }

    fn flag_once(&mut self, tag: u8, name: &str) -> TxResult<()> {
        if self.seen.contains(&tag) {
            return Err(TxError::OptionConflict(format!(
                "{} specified more than once",
                name
            )));
        }
        self.seen.push(tag);
        Ok(())
    }

    fn apply(&mut self, item: TpbItem<'_>) -> TxResult<()> {
        match item {
            TpbItem::Flag(tag) => self.apply_flag(tag),
            TpbItem::LockTimeout(value) => {
                if value.is_empty() || value.len() > 4 {
                    return Err(TxError::InvalidTpb(format!(
                        "lock timeout has invalid length {}",
                        value.len()
                    )));
                }
                if self.lock_timeout.is_some() {
                    return Err(TxError::OptionConflict(
                        "lock timeout specified more than once".into(),
                    ));
                }
                let mut bytes = [0u8; 4];
                bytes[..value.len()].copy_from_slice(value);
                self.lock_timeout = Some(Duration::from_secs(u32::from_le_bytes(bytes) as u64));
                Ok(())
            }
            TpbItem::Reserve { tag, name, share } => {
                let relation = std::str::from_utf8(name)
                    .map_err(|_| TxError::InvalidTpb("relation name is not valid UTF-8".into()))?;
                check_identifier(relation)?;
                self.options.reservations.push(Reservation {
                    relation: relation.to_string(),
                    access: if tag == TPB_LOCK_READ {
                        ReserveAccess::Read
                    } else {
                        ReserveAccess::Write
                    },
                    share: share.map(|b| match b {
                        TPB_SHARED => ShareMode::Shared,
                        TPB_PROTECTED => ShareMode::Protected,
                        _ => ShareMode::Exclusive,
                    }),
                });
                Ok(())
            }
        }
    }

    fn apply_flag(&mut self, tag: u8) -> TxResult<()> {
        match tag {
            TPB_CONSISTENCY | TPB_CONCURRENCY | TPB_READ_COMMITTED => {
                Self::set_once(&mut self.isolation, tag, "isolation")
            }
            TPB_REC_VERSION | TPB_NO_REC_VERSION | TPB_READ_CONSISTENCY => {
                Self::set_once(&mut self.rc_mode, tag, "read committed mode")
            }
            TPB_READ | TPB_WRITE => Self::set_once(&mut self.access, tag, "access mode"),
            TPB_WAIT | TPB_NOWAIT => Self::set_once(&mut self.wait, tag, "wait mode"),
            TPB_AUTOCOMMIT => {
                self.flag_once(tag, "autocommit")?;
                self.options.autocommit = true;
                Ok(())
            }
            TPB_NO_AUTO_UNDO => {
                self.flag_once(tag, "no_auto_undo")?;
                self.options.no_auto_undo = true;
                Ok(())
            }
            TPB_IGNORE_LIMBO => {
                self.flag_once(tag, "ignore_limbo")?;
                self.options.ignore_limbo = true;
                Ok(())
            }
            TPB_RESTART_REQUESTS => {
                self.flag_once(tag, "restart_requests")?;
                self.options.restart_requests = true;
                Ok(())
            }
            TPB_SHARED | TPB_PROTECTED | TPB_EXCLUSIVE => Err(TxError::InvalidTpb(format!(
                "share mode {} must follow a table reservation",
                tag
            ))),
            other => Err(TxError::InvalidTpb(format!("unknown item {}", other))),
        }
    }

    fn finish(mut self) -> TxResult<TransactionOptions> {
        self.options.isolation = match (self.isolation, self.rc_mode) {
            (Some(TPB_READ_COMMITTED), mode) => IsolationMode::ReadCommitted(match mode {
                Some(TPB_REC_VERSION) => ReadCommittedMode::RecordVersion,
                Some(TPB_READ_CONSISTENCY) => ReadCommittedMode::ReadConsistency,
                _ => ReadCommittedMode::NoRecordVersion,
            }),
            (_, Some(_)) => {
                return Err(TxError::OptionConflict(
                    "record version options require read committed isolation".into(),
                ))
            }
            (Some(TPB_CONSISTENCY), None) => IsolationMode::Consistency,
            _ => IsolationMode::Concurrency,
        };
        if self.access == Some(TPB_READ) {
            self.options.access = AccessMode::ReadOnly;
        }
        if self.wait == Some(TPB_NOWAIT) {
            if self.lock_timeout.is_some() {
                return Err(TxError::OptionConflict(
                    "lock timeout cannot be combined with nowait".into(),
                ));
            }
            self.options.wait = false;
        }
        self.options.lock_timeout = self.lock_timeout;
        Ok(self.options)
    }
}

/// 解析 TPB；空缓冲区得到默认选项
pub fn parse_tpb(buffer: &[u8]) -> TxResult<TransactionOptions> {
    let Some((&version, body)) = buffer.split_first() else {
        return Ok(TransactionOptions::default());
    };
    if version != TPB_VERSION1 && version != TPB_VERSION3 {
        return Err(TxError::InvalidTpb(format!("unsupported version {}", version)));
    }

    let (rest, parsed) =
        items(body).map_err(|e| TxError::InvalidTpb(format!("parse error: {:?}", e)))?;
    if !rest.is_empty() {
        return Err(TxError::InvalidTpb(format!(
            "truncated item at offset {}",
            buffer.len() - rest.len()
        )));
    }

    let mut builder = TpbBuilder::default();
    for item in parsed {
        builder.apply(item)?;
    }
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_buffer_defaults() {
        let options = parse_tpb(&[]).unwrap();
        assert_eq!(options, TransactionOptions::default());
        assert_eq!(parse_tpb(&[TPB_VERSION3]).unwrap(), TransactionOptions::default());
    }

    #[test]
    fn test_read_committed_read_only() {
        let options = parse_tpb(&[
            TPB_VERSION3,
            TPB_READ_COMMITTED,
            TPB_REC_VERSION,
            TPB_READ,
            TPB_NOWAIT,
        ])
        .unwrap();
        assert_eq!(
            options.isolation,
            IsolationMode::ReadCommitted(ReadCommittedMode::RecordVersion)
        );
        assert!(options.is_read_only());
        assert!(!options.wait);
        assert_eq!(options.lock_wait(Some(Duration::from_secs(5))), LockWait::NoWait);
    }

    #[test]
    fn test_rc_mode_defaults_to_no_rec_version() {
        let options = parse_tpb(&[TPB_VERSION1, TPB_READ_COMMITTED]).unwrap();
        assert_eq!(
            options.isolation,
            IsolationMode::ReadCommitted(ReadCommittedMode::NoRecordVersion)
        );
    }

    #[test]
    fn test_lock_timeout() {
        let options = parse_tpb(&[TPB_VERSION3, TPB_WAIT, TPB_LOCK_TIMEOUT, 2, 0x2c, 0x01]).unwrap();
        assert_eq!(options.lock_timeout, Some(Duration::from_secs(300)));
        assert_eq!(
            options.lock_wait(None),
            LockWait::Timeout(Duration::from_secs(300))
        );

        let err = parse_tpb(&[TPB_VERSION3, TPB_LOCK_TIMEOUT, 5, 1, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, TxError::InvalidTpb(_)));
        let err = parse_tpb(&[TPB_VERSION3, TPB_NOWAIT, TPB_LOCK_TIMEOUT, 1, 9]).unwrap_err();
        assert!(matches!(err, TxError::OptionConflict(_)));
    }

    #[test]
    fn test_default_wait_uses_config_timeout() {
        let options = TransactionOptions::default();
        assert_eq!(options.lock_wait(None), LockWait::Wait);
        assert_eq!(
            options.lock_wait(Some(Duration::from_millis(10))),
            LockWait::Timeout(Duration::from_millis(10))
        );
    }

    #[test]
    fn test_reservations() {
        let mut buf = vec![TPB_VERSION3, TPB_CONSISTENCY, TPB_LOCK_WRITE, 3];
        buf.extend_from_slice(b"EMP");
        buf.push(TPB_EXCLUSIVE);
        buf.push(TPB_LOCK_READ);
        buf.push(4);
        buf.extend_from_slice(b"DEPT");
        let options = parse_tpb(&buf).unwrap();
        assert_eq!(options.isolation, IsolationMode::Consistency);
        assert_eq!(
            options.reservations,
            vec![
                Reservation {
                    relation: "EMP".into(),
                    access: ReserveAccess::Write,
                    share: Some(ShareMode::Exclusive),
                },
                Reservation {
                    relation: "DEPT".into(),
                    access: ReserveAccess::Read,
                    share: None,
                },
            ]
        );
    }

    #[test]
    fn test_identifier_too_long() {
        let name = vec![b'A'; 64];
        let mut buf = vec![TPB_VERSION3, TPB_LOCK_READ, name.len() as u8];
        buf.extend_from_slice(&name);
        assert!(matches!(
            parse_tpb(&buf),
            Err(TxError::IdentifierTooLong { max: 63, .. })
        ));
    }

    #[test]
    fn test_rejects_malformed() {
        // 版本号
        assert!(matches!(parse_tpb(&[2, TPB_CONCURRENCY]), Err(TxError::InvalidTpb(_))));
        // 未知标签
        assert!(matches!(parse_tpb(&[TPB_VERSION3, 99]), Err(TxError::InvalidTpb(_))));
        // 截断的关系名
        assert!(matches!(
            parse_tpb(&[TPB_VERSION3, TPB_LOCK_READ, 10, b'A']),
            Err(TxError::InvalidTpb(_))
        ));
        // 单独出现的共享方式
        assert!(matches!(
            parse_tpb(&[TPB_VERSION3, TPB_PROTECTED]),
            Err(TxError::InvalidTpb(_))
        ));
    }

    #[test]
    fn test_rejects_conflicts() {
        for buf in [
            vec![TPB_VERSION3, TPB_CONCURRENCY, TPB_CONSISTENCY],
            vec![TPB_VERSION3, TPB_READ, TPB_WRITE],
            vec![TPB_VERSION3, TPB_WAIT, TPB_NOWAIT],
            vec![TPB_VERSION3, TPB_CONCURRENCY, TPB_CONCURRENCY],
            vec![TPB_VERSION3, TPB_AUTOCOMMIT, TPB_AUTOCOMMIT],
            vec![TPB_VERSION3, TPB_CONCURRENCY, TPB_REC_VERSION],
            vec![TPB_VERSION3, TPB_READ_COMMITTED, TPB_REC_VERSION, TPB_NO_REC_VERSION],
        ] {
            assert!(
                matches!(parse_tpb(&buf), Err(TxError::OptionConflict(_))),
                "{:?}",
                buf
            );
        }
    }

    #[test]
    fn test_encode_then_parse() {
        let options = TransactionOptions::read_committed(ReadCommittedMode::ReadConsistency)
            .read_only()
            .with_lock_timeout(Duration::from_secs(3))
            .autocommit()
            .reserve("EMP", ReserveAccess::Write, Some(ShareMode::Protected));
        assert_eq!(parse_tpb(&options.to_tpb()).unwrap(), options);
    }
}

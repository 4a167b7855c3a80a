// 事务标志位

use bitflags::bitflags;

bitflags! {
    /// 事务控制块上的标志集合
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TraFlags: u32 {
        /// 事务已写入数据
        const WRITE            = 1 << 0;
        /// 只读事务
        const READ_ONLY        = 1 << 1;
        /// 每个请求结束后自动保留提交
        const AUTOCOMMIT       = 1 << 2;
        /// 启动时已预提交（只读 + 读已提交）
        const PRECOMMITTED     = 1 << 3;
        /// I/O 失败后失效，只能回滚
        const INVALIDATED      = 1 << 4;
        /// 已进入 limbo
        const PREPARED         = 1 << 5;
        /// 通过重连获得
        const RECONNECTED      = 1 << 6;
        /// 系统事务
        const SYSTEM           = 1 << 7;
        /// 不记录撤销日志
        const NO_AUTO_UNDO     = 1 << 8;
        /// 读取时跳过 limbo 版本
        const IGNORE_LIMBO     = 1 << 9;
        /// 冲突时重启请求
        const RESTART_REQUESTS = 1 << 10;
    }
}

impl TraFlags {
    /// 是否仍允许写入
    pub fn writable(&self) -> bool {
        !self.intersects(
            TraFlags::READ_ONLY
                | TraFlags::INVALIDATED
                | TraFlags::PREPARED
                | TraFlags::RECONNECTED
                | TraFlags::PRECOMMITTED,
        )
    }
}

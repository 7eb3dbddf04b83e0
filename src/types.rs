//! ModuleFabric 核心数据类型
//!
//! 实例、接口和时间戳等基础标识类型

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// 纳秒时间戳
pub type TimestampNs = i64;

/// 当前时间（纳秒）
pub fn now_ns() -> TimestampNs {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

/// 模块实例ID（进程内单调递增，永不复用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 接口契约标识，每个契约全局唯一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceId(Uuid);

impl InterfaceId {
    /// 从固定常量创建（契约定义时使用）
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// 随机生成新的标识
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 绑定记录ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingId(u64);

impl BindingId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "binding-{}", self.0)
    }
}

/// 宿主生命周期事件（设备启动/停止/电源转换）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostEvent {
    /// 硬件资源就绪
    PrepareHardware,
    /// 进入工作电源状态
    D0Entry,
    /// 离开工作电源状态
    D0Exit,
    /// 硬件资源释放
    ReleaseHardware,
}

impl HostEvent {
    /// 是否为进入类事件（自上而下遍历）
    pub fn is_entry(&self) -> bool {
        matches!(self, Self::PrepareHardware | Self::D0Entry)
    }

    /// 与之配对的事件
    pub fn counterpart(&self) -> Self {
        match self {
            Self::PrepareHardware => Self::ReleaseHardware,
            Self::D0Entry => Self::D0Exit,
            Self::D0Exit => Self::D0Entry,
            Self::ReleaseHardware => Self::PrepareHardware,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_ids_are_unique() {
        let a = InstanceId::next();
        let b = InstanceId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_interface_id_from_constant() {
        const BUS: InterfaceId = InterfaceId::from_u128(0x42);
        assert_eq!(BUS, InterfaceId::from_u128(0x42));
        assert_ne!(BUS, InterfaceId::random());
    }

    #[test]
    fn test_interface_id_serializes_as_uuid() {
        let id = InterfaceId::from_u128(0x6d66_0001);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));

        let parsed: InterfaceId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_host_event_pairs() {
        assert!(HostEvent::D0Entry.is_entry());
        assert!(!HostEvent::ReleaseHardware.is_entry());
        assert_eq!(HostEvent::D0Entry.counterpart(), HostEvent::D0Exit);
        assert_eq!(HostEvent::ReleaseHardware.counterpart(), HostEvent::PrepareHardware);
    }
}

//! 生命周期事件总线
//!
//! 基于广播通道发布实例状态转换、绑定变化和宿主事件投递。
//! 发布从不阻塞，也从不使触发它的操作失败。

use crate::types::{now_ns, HostEvent, InstanceId, TimestampNs};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// 生命周期事件类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEventKind {
    /// 实例已构造
    Created,
    /// 开始打开
    Opening,
    /// 打开完成
    Opened,
    /// 打开失败，已回退到Closed
    OpenFailed,
    /// 开始关闭
    Closing,
    /// 关闭完成
    Closed,
    /// 实例已销毁
    Destroyed,
    /// 构造失败，已回滚
    ConstructionRolledBack,
    /// 绑定建立
    Bound { interface: String },
    /// 绑定解除
    Unbound { interface: String },
    /// 绑定在PostBind失败后回滚
    BindRolledBack { interface: String },
    /// 宿主事件已投递到实例
    HostNotified(HostEvent),
}

/// 生命周期事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// 实例ID
    pub instance: InstanceId,
    /// 模块类型名称
    pub type_name: String,
    /// 事件类型
    pub kind: LifecycleEventKind,
    /// 事件时间
    pub timestamp_ns: TimestampNs,
}

/// 生命周期事件总线
#[derive(Debug, Clone)]
pub struct LifecycleEventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleEventBus {
    /// 创建新的事件总线
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 发布事件
    pub fn publish(&self, instance: InstanceId, type_name: &str, kind: LifecycleEventKind) {
        let event = LifecycleEvent {
            instance,
            type_name: type_name.to_string(),
            kind,
            timestamp_ns: now_ns(),
        };
        trace!(instance = %event.instance, type_name, kind = ?event.kind, "lifecycle event");

        // 没有订阅者时发送失败，忽略即可
        let _ = self.sender.send(event);
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

impl Default for LifecycleEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// 从接收端取出当前已缓冲的全部事件（测试和诊断使用）
pub fn drain(receiver: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!("Lifecycle event receiver lagged by {} events", skipped);
            }
            Err(_) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = LifecycleEventBus::new(4);
        bus.publish(InstanceId::next(), "Idle", LifecycleEventKind::Created);

        // 晚到的订阅者看不到之前的事件
        let mut late = bus.subscribe();
        assert!(drain(&mut late).is_empty());
    }

    #[test]
    fn test_subscriber_receives_in_order() {
        let bus = LifecycleEventBus::new(16);
        let mut receiver = bus.subscribe();
        let id = InstanceId::next();

        bus.publish(id, "Leaf", LifecycleEventKind::Opening);
        bus.publish(id, "Leaf", LifecycleEventKind::Opened);

        let kinds: Vec<_> = drain(&mut receiver).into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![LifecycleEventKind::Opening, LifecycleEventKind::Opened]
        );
    }

    #[test]
    fn test_event_serializes_to_json() {
        let event = LifecycleEvent {
            instance: InstanceId::next(),
            type_name: "Sensor".to_string(),
            kind: LifecycleEventKind::Bound {
                interface: "SensorBus".to_string(),
            },
            timestamp_ns: now_ns(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"Bound\""));
        let parsed: LifecycleEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}

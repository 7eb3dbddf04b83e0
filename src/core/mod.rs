//! 核心基础层模块
//!
//! 提供框架的并发原语和生命周期事件总线

pub mod doorbell;
pub mod events;

// 重新导出核心组件
pub use doorbell::*;
pub use events::{LifecycleEvent, LifecycleEventBus, LifecycleEventKind};

//! 实例生命周期状态机
//!
//! 状态只由实例树管理器推进：
//! `Created → Opening → Open → Closing → Closed`，以及终态 `Destroyed`。
//! 同一实例的转换经由转换闸门依次进行，并发的打开/关闭会等待进行中的转换完成。
//! 回调在不持有任何实例状态锁的情况下调用。

use super::instance::{InstanceNode, ModuleContext};
use crate::core::events::{LifecycleEventBus, LifecycleEventKind};
use crate::types::HostEvent;
use crate::{ModuleError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// 已构造，从未打开
    Created,
    /// 打开中
    Opening,
    /// 已打开
    Open,
    /// 关闭中
    Closing,
    /// 已关闭
    Closed,
    /// 已销毁（终态）
    Destroyed,
}

impl LifecycleState {
    /// 状态转换是否合法
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Created, Opening)
                | (Closed, Opening)
                | (Opening, Open)
                | (Opening, Closed)
                | (Open, Closing)
                | (Closing, Closed)
                | (Created, Destroyed)
                | (Closed, Destroyed)
        )
    }

    /// 是否处于可销毁的静止状态
    pub fn is_quiescent(self) -> bool {
        matches!(self, LifecycleState::Created | LifecycleState::Closed)
    }

    /// 是否有转换正在进行
    pub fn is_transitioning(self) -> bool {
        matches!(self, LifecycleState::Opening | LifecycleState::Closing)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "Created",
            LifecycleState::Opening => "Opening",
            LifecycleState::Open => "Open",
            LifecycleState::Closing => "Closing",
            LifecycleState::Closed => "Closed",
            LifecycleState::Destroyed => "Destroyed",
        };
        f.write_str(name)
    }
}

/// 执行一次状态转换
pub(crate) fn transition(state: &mut LifecycleState, next: LifecycleState) -> Result<()> {
    if !state.can_transition_to(next) {
        return Err(ModuleError::invalid_parameter(format!(
            "illegal lifecycle transition {} -> {}",
            state, next
        )));
    }
    *state = next;
    Ok(())
}

/// 单个实例的生命周期驱动器
pub(crate) struct LifecycleDriver<'a> {
    events: &'a LifecycleEventBus,
}

impl<'a> LifecycleDriver<'a> {
    pub(crate) fn new(events: &'a LifecycleEventBus) -> Self {
        Self { events }
    }

    /// 打开实例。已打开时不再调用打开回调，返回`Ok(false)`。
    /// 打开回调失败时实例回退到Closed。
    pub(crate) fn open(&self, node: &Arc<InstanceNode>) -> Result<bool> {
        let _gate = node.transition.lock();
        {
            let mut state = node.state.lock();
            if state.lifecycle == LifecycleState::Open {
                return Ok(false);
            }
            transition(&mut state.lifecycle, LifecycleState::Opening)?;
        }
        self.events
            .publish(node.id, node.type_name(), LifecycleEventKind::Opening);

        let result = match node.ty.descriptor().callbacks.open.clone() {
            Some(open) => node.with_dispatch(|| open(&ModuleContext::new(node))),
            None => Ok(()),
        };

        let mut state = node.state.lock();
        match result {
            Ok(()) => {
                transition(&mut state.lifecycle, LifecycleState::Open)?;
                drop(state);
                self.events
                    .publish(node.id, node.type_name(), LifecycleEventKind::Opened);
                debug!(instance = %node.id, type_name = node.type_name(), "Module opened");
                Ok(true)
            }
            Err(e) => {
                transition(&mut state.lifecycle, LifecycleState::Closed)?;
                drop(state);
                self.events
                    .publish(node.id, node.type_name(), LifecycleEventKind::OpenFailed);
                error!(instance = %node.id, type_name = node.type_name(), "Module open failed: {}", e);
                Err(ModuleError::OpenFailed {
                    type_name: node.type_name().to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// 关闭实例。Created/Closed时为空操作，返回`false`。
    /// 其他线程上进行中的打开先完成，随后再关闭。
    /// 关闭回调按约定是同步的：返回时实例启动的工作都已刷新或取消。
    pub(crate) fn close(&self, node: &Arc<InstanceNode>) -> bool {
        let _gate = node.transition.lock();
        {
            let mut state = node.state.lock();
            if state.lifecycle != LifecycleState::Open {
                // 闸门可重入：只有本线程自己的回调里才会看到转换中的状态
                if state.lifecycle.is_transitioning() {
                    warn!(
                        instance = %node.id,
                        state = %state.lifecycle,
                        "Close requested from within the instance's own transition"
                    );
                }
                return false;
            }
            state.lifecycle = LifecycleState::Closing;
        }
        self.events
            .publish(node.id, node.type_name(), LifecycleEventKind::Closing);

        if let Some(close) = node.ty.descriptor().callbacks.close.clone() {
            node.with_dispatch(|| close(&ModuleContext::new(node)));
        }

        node.state.lock().lifecycle = LifecycleState::Closed;
        self.events
            .publish(node.id, node.type_name(), LifecycleEventKind::Closed);
        debug!(instance = %node.id, type_name = node.type_name(), "Module closed");
        true
    }

    /// 向实例投递宿主事件
    pub(crate) fn notify(&self, node: &Arc<InstanceNode>, event: HostEvent) -> Result<()> {
        let Some(notify) = node.ty.descriptor().callbacks.notify.clone() else {
            return Ok(());
        };

        node.with_dispatch(|| notify(&ModuleContext::new(node), event))?;
        self.events.publish(
            node.id,
            node.type_name(),
            LifecycleEventKind::HostNotified(event),
        );
        Ok(())
    }

    /// 销毁实例：调用销毁回调并进入终态
    pub(crate) fn destroy(&self, node: &Arc<InstanceNode>) -> Result<()> {
        let _gate = node.transition.lock();
        {
            let state = node.state.lock();
            if !state.lifecycle.is_quiescent() {
                return Err(ModuleError::invalid_parameter(format!(
                    "cannot destroy '{}' {} in state {}",
                    node.type_name(),
                    node.id,
                    state.lifecycle
                )));
            }
        }

        if let Some(destroy) = node.ty.descriptor().callbacks.destroy.clone() {
            node.with_dispatch(|| destroy(&ModuleContext::new(node)));
        }

        transition(&mut node.state.lock().lifecycle, LifecycleState::Destroyed)?;
        self.events
            .publish(node.id, node.type_name(), LifecycleEventKind::Destroyed);
        info!(instance = %node.id, type_name = node.type_name(), "Module destroyed");
        Ok(())
    }
}

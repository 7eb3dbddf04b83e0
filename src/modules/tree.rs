//! 实例树管理器
//!
//! 负责从描述符构造、打开、关闭和销毁模块实例树：
//! - 父实例独占拥有子实例，子实例按注册顺序排列
//! - 打开按前序（父先于子），关闭严格按打开的逆序
//! - 销毁先子后父，兄弟之间后进先出
//! - 构造失败时自动回滚，不留下半构造的实例

use super::descriptor::{OpenOption, TypeHandle};
use super::instance::{ChildBuilder, Endpoint, InstanceNode, ModuleContext, ModuleHandle, NodeState};
use super::lifecycle::{LifecycleDriver, LifecycleState};
use crate::config::RuntimeSettings;
use crate::core::events::{LifecycleEvent, LifecycleEventBus, LifecycleEventKind};
use crate::types::{HostEvent, InstanceId};
use crate::{ModuleError, Result};
use parking_lot::{Mutex, ReentrantMutex};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// 实例树管理器
pub struct InstanceTree {
    roots: Mutex<Vec<Arc<InstanceNode>>>,
    live: AtomicUsize,
    max_instances: usize,
    events: LifecycleEventBus,
}

impl InstanceTree {
    /// 按运行时设置创建
    pub fn new(settings: &RuntimeSettings) -> Self {
        Self::with_limits(settings.max_instances, settings.event_capacity)
    }

    /// 指定实例上限和事件通道容量
    pub fn with_limits(max_instances: usize, event_capacity: usize) -> Self {
        Self {
            roots: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
            max_instances,
            events: LifecycleEventBus::new(event_capacity),
        }
    }

    /// 生命周期事件总线
    pub fn events(&self) -> &LifecycleEventBus {
        &self.events
    }

    /// 订阅生命周期事件
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn driver(&self) -> LifecycleDriver<'_> {
        LifecycleDriver::new(&self.events)
    }

    /// 创建实例。子模块在返回前递归构造完成；
    /// OnCreate策略的实例随后按前序打开，但只在其父实例已经打开（或为根）时打开。
    pub fn create_instance<Cfg>(
        &self,
        ty: &TypeHandle,
        parent: Option<&ModuleHandle>,
        config: Cfg,
    ) -> Result<ModuleHandle>
    where
        Cfg: Send + Sync + 'static,
    {
        let parent_node = parent.map(ModuleHandle::upgrade).transpose()?;
        let parent_link = parent_node
            .as_ref()
            .map(Arc::downgrade)
            .unwrap_or_else(Weak::new);

        let node = self.construct(ty, parent_link, Box::new(config))?;

        match &parent_node {
            Some(parent_node) => {
                let mut state = parent_node.state.lock();
                if state.lifecycle == LifecycleState::Destroyed {
                    drop(state);
                    self.teardown(&node);
                    return Err(ModuleError::invalid_parameter(format!(
                        "parent {} was destroyed during construction",
                        parent_node.id
                    )));
                }
                state.children.push(node.clone());
            }
            None => self.roots.lock().push(node.clone()),
        }

        if let Err(e) = self.open_on_create(&node) {
            self.detach(&node);
            self.teardown(&node);
            return Err(e);
        }

        info!(
            instance = %node.id,
            type_name = node.type_name(),
            parent = ?parent_node.as_ref().map(|p| p.id),
            "Module instance created"
        );
        Ok(node.handle())
    }

    /// 构造一个实例及其整个子树（不挂接到父实例）
    pub(crate) fn construct(
        &self,
        ty: &TypeHandle,
        parent: Weak<InstanceNode>,
        config: Box<dyn Any + Send + Sync>,
    ) -> Result<Arc<InstanceNode>> {
        let descriptor = ty.descriptor();
        if !descriptor.accepts_config(&*config) {
            return Err(ModuleError::invalid_parameter(format!(
                "config for '{}' must be a {}",
                descriptor.type_name, descriptor.config_type
            )));
        }

        self.reserve(ty)?;
        let context = match (descriptor.context_factory)(&*config) {
            Ok(context) => context,
            Err(e) => {
                self.release();
                return Err(e);
            }
        };

        let id = InstanceId::next();
        let node = Arc::new_cyclic(|weak: &Weak<InstanceNode>| {
            let handle = ModuleHandle::from_weak(id, weak.clone());
            let endpoints = descriptor
                .interfaces
                .iter()
                .map(|declaration| Endpoint {
                    interface_id: declaration.interface.id,
                    version: declaration.interface.version.clone(),
                    role: declaration.role,
                    requirement: declaration.requirement.clone(),
                    object: (declaration.factory)(&handle),
                })
                .collect();

            InstanceNode {
                id,
                ty: ty.clone(),
                config,
                context: Mutex::new(context),
                state: Mutex::new(NodeState {
                    lifecycle: LifecycleState::Created,
                    children: Vec::new(),
                    slots: HashMap::new(),
                }),
                dispatch: ReentrantMutex::new(()),
                transition: ReentrantMutex::new(()),
                parent,
                endpoints,
            }
        });
        self.events
            .publish(node.id, node.type_name(), LifecycleEventKind::Created);
        debug!(instance = %node.id, type_name = node.type_name(), "Module constructed");

        // 构造期间实例对外不可达，子模块回调无需持有实例锁
        if let Some(child_modules_add) = descriptor.callbacks.child_modules_add.clone() {
            let mut builder = ChildBuilder::new(self, &node);
            let result = child_modules_add(&ModuleContext::new(&node), &mut builder);
            let children = std::mem::take(&mut builder.children);

            match result {
                Ok(()) => node.state.lock().children = children,
                Err(e) => {
                    warn!(
                        instance = %node.id,
                        type_name = node.type_name(),
                        built = children.len(),
                        "Child construction failed, rolling back: {}",
                        e
                    );
                    for child in children.iter().rev() {
                        self.teardown(child);
                    }
                    self.teardown(&node);
                    self.events.publish(
                        node.id,
                        node.type_name(),
                        LifecycleEventKind::ConstructionRolledBack,
                    );
                    return Err(e);
                }
            }
        }

        Ok(node)
    }

    /// 销毁实例。实例必须处于Created或Closed，且子树中没有活动绑定。
    pub fn destroy_instance(&self, handle: &ModuleHandle) -> Result<()> {
        let node = handle.upgrade()?;
        let state = node.lifecycle();
        if !state.is_quiescent() {
            return Err(ModuleError::invalid_parameter(format!(
                "cannot destroy '{}' {} while {}",
                node.type_name(),
                node.id,
                state
            )));
        }

        if let Some(bound) = pre_order(&node).into_iter().find(|n| n.has_bindings()) {
            return Err(ModuleError::invalid_parameter(format!(
                "cannot destroy '{}' {}: '{}' {} is still bound",
                node.type_name(),
                node.id,
                bound.type_name(),
                bound.id
            )));
        }

        if !self.detach(&node) {
            return Err(ModuleError::invalid_parameter(format!(
                "instance {} is not attached to this tree",
                node.id
            )));
        }

        self.teardown(&node);
        info!(instance = %node.id, type_name = node.type_name(), "Module instance destroyed");
        Ok(())
    }

    /// 打开实例及其子树（前序）。任一实例打开失败时，
    /// 本次已打开的实例按逆序关闭后报告失败。
    pub fn open_instance(&self, handle: &ModuleHandle) -> Result<()> {
        let node = handle.upgrade()?;
        self.open_pass(&pre_order(&node), |_| true, None)
    }

    /// 关闭实例及其子树（打开顺序的逆序）
    pub fn close_instance(&self, handle: &ModuleHandle) -> Result<()> {
        let node = handle.upgrade()?;
        self.close_subtree(&node);
        Ok(())
    }

    /// 向以root为根的子树投递宿主事件。
    /// 进入事件按前序：匹配策略的实例先打开，再收到通知；
    /// 退出事件按逆序：先通知，再关闭匹配策略的实例。
    /// 退出通知失败不会中断逆序过程，全部完成后返回第一个错误。
    pub fn deliver(&self, root: &ModuleHandle, event: HostEvent) -> Result<()> {
        let node = root.upgrade()?;
        let nodes = pre_order(&node);
        debug!(root = %node.id, event = ?event, instances = nodes.len(), "Delivering host event");

        if event.is_entry() {
            return self.open_pass(
                &nodes,
                |n| n.ty.descriptor().open_option.matches(event),
                Some(event),
            );
        }

        let driver = self.driver();
        let mut first_error = None;
        for n in nodes.iter().rev() {
            if let Err(e) = driver.notify(n, event) {
                error!(instance = %n.id, type_name = n.type_name(), event = ?event, "Notify failed: {}", e);
                first_error.get_or_insert(e);
            }
            if n.ty.descriptor().open_option.matches(event) {
                driver.close(n);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// 当前生命周期状态
    pub fn state(&self, handle: &ModuleHandle) -> Result<LifecycleState> {
        Ok(handle.upgrade()?.lifecycle())
    }

    /// 子实例（按注册顺序）
    pub fn children(&self, handle: &ModuleHandle) -> Result<Vec<ModuleHandle>> {
        let node = handle.upgrade()?;
        Ok(node.children().iter().map(|child| child.handle()).collect())
    }

    /// 父实例（根实例为None）
    pub fn parent(&self, handle: &ModuleHandle) -> Result<Option<ModuleHandle>> {
        let node = handle.upgrade()?;
        Ok(node.parent.upgrade().map(|parent| parent.handle()))
    }

    /// 根实例（按创建顺序）
    pub fn roots(&self) -> Vec<ModuleHandle> {
        self.roots.lock().iter().map(|root| root.handle()).collect()
    }

    /// 存活实例数量
    pub fn instance_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// 关闭并销毁全部根实例（逆创建顺序）。仍然存在的绑定在拆除前被强制解除。
    pub fn shutdown(&self) {
        let roots = std::mem::take(&mut *self.roots.lock());
        info!("Shutting down instance tree with {} roots", roots.len());

        for root in roots.iter().rev() {
            if pre_order(root).iter().any(|n| n.has_bindings()) {
                warn!(
                    instance = %root.id,
                    type_name = root.type_name(),
                    "Tearing down a subtree that still has bindings"
                );
            }
            self.teardown(root);
        }
    }

    /// 父实例已打开（或没有父实例）时才自动打开OnCreate实例。
    /// 前序遍历保证父实例先于子实例被处理。
    fn open_on_create(&self, node: &Arc<InstanceNode>) -> Result<()> {
        self.open_pass(
            &pre_order(node),
            |n| {
                n.ty.descriptor().open_option == OpenOption::OnCreate
                    && n
                        .parent
                        .upgrade()
                        .map_or(true, |parent| parent.lifecycle() == LifecycleState::Open)
            },
            None,
        )
    }

    /// 前序打开一组实例，可选地在每个实例上投递进入事件。失败时逆序回滚。
    fn open_pass(
        &self,
        nodes: &[Arc<InstanceNode>],
        should_open: impl Fn(&InstanceNode) -> bool,
        event: Option<HostEvent>,
    ) -> Result<()> {
        let driver = self.driver();
        let mut opened: Vec<&Arc<InstanceNode>> = Vec::new();

        for node in nodes {
            let step = (|| -> Result<()> {
                if should_open(&**node) && driver.open(node)? {
                    opened.push(node);
                }
                match event {
                    Some(event) => driver.notify(node, event),
                    None => Ok(()),
                }
            })();

            if let Err(e) = step {
                warn!(
                    instance = %node.id,
                    type_name = node.type_name(),
                    unwinding = opened.len(),
                    "Open pass failed: {}",
                    e
                );
                for n in opened.iter().rev() {
                    driver.close(n);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn close_subtree(&self, node: &Arc<InstanceNode>) {
        let driver = self.driver();
        for n in pre_order(node).iter().rev() {
            driver.close(n);
        }
    }

    /// 关闭并递归销毁子树：先子后父，兄弟逆注册顺序。
    /// 子树上残留的绑定先按逆序解除。
    fn teardown(&self, node: &Arc<InstanceNode>) {
        for n in pre_order(node).iter().rev() {
            for link in n.binding_links() {
                link.sever();
            }
        }
        self.close_subtree(node);

        let children = std::mem::take(&mut node.state.lock().children);
        for child in children.iter().rev() {
            self.teardown(child);
        }

        if let Err(e) = self.driver().destroy(node) {
            error!(instance = %node.id, type_name = node.type_name(), "Forced destroy: {}", e);
            node.state.lock().lifecycle = LifecycleState::Destroyed;
        }
        self.release();
    }

    /// 从父实例或根列表中摘除
    fn detach(&self, node: &Arc<InstanceNode>) -> bool {
        let mut removed = false;
        let mut remove = |list: &mut Vec<Arc<InstanceNode>>| {
            let before = list.len();
            list.retain(|n| !Arc::ptr_eq(n, node));
            removed = list.len() != before;
        };

        match node.parent.upgrade() {
            Some(parent) => remove(&mut parent.state.lock().children),
            None => remove(&mut *self.roots.lock()),
        }
        removed
    }

    fn reserve(&self, ty: &TypeHandle) -> Result<()> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.max_instances).then_some(live + 1)
            })
            .map(|_| ())
            .map_err(|live| {
                ModuleError::insufficient_resources(format!(
                    "instance limit {} reached ({} live) while creating '{}'",
                    self.max_instances,
                    live,
                    ty.type_name()
                ))
            })
    }

    fn release(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for InstanceTree {
    fn default() -> Self {
        Self::with_limits(4096, 1024)
    }
}

/// 前序遍历（父先于子，兄弟按注册顺序）
pub(crate) fn pre_order(node: &Arc<InstanceNode>) -> Vec<Arc<InstanceNode>> {
    let mut nodes = vec![node.clone()];
    for child in node.children() {
        nodes.extend(pre_order(&child));
    }
    nodes
}

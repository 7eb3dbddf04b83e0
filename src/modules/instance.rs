//! 模块实例、句柄与回调上下文
//!
//! 实例由父实例独占拥有（`Arc`存放在父实例的子列表中），
//! 句柄和父引用都是非拥有的弱引用。

use super::binding::InterfaceRole;
use super::descriptor::{ContextBox, DispatchMode, TypeHandle};
use super::lifecycle::LifecycleState;
use super::tree::InstanceTree;
use crate::error::misuse;
use crate::types::{BindingId, InstanceId, InterfaceId};
use crate::{ModuleError, Result};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard, ReentrantMutex, ReentrantMutexGuard};
use semver::{Version, VersionReq};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// 方法调用等待实例锁时重新检查状态的间隔
const METHOD_LOCK_POLL: Duration = Duration::from_millis(5);

/// 实例上的接口端点
pub(crate) struct Endpoint {
    pub(crate) interface_id: InterfaceId,
    pub(crate) version: Version,
    pub(crate) role: InterfaceRole,
    pub(crate) requirement: Option<VersionReq>,
    pub(crate) object: Arc<dyn Any + Send + Sync>,
}

/// 已提交绑定在端点上的反向链接，实例拆除时用它强制解绑
pub(crate) trait BindingLink: Send + Sync {
    fn binding_id(&self) -> BindingId;

    /// 解除绑定；绑定已解除时为空操作
    fn sever(&self);
}

/// 绑定占位：预留（两阶段提交进行中）或已提交
#[derive(Clone)]
pub(crate) enum BindingSlot {
    Reserved,
    Bound(Arc<dyn BindingLink>),
}

/// 受实例锁保护的可变状态
pub(crate) struct NodeState {
    pub(crate) lifecycle: LifecycleState,
    pub(crate) children: Vec<Arc<InstanceNode>>,
    pub(crate) slots: HashMap<(InterfaceId, InterfaceRole), BindingSlot>,
}

/// 模块实例
pub(crate) struct InstanceNode {
    pub(crate) id: InstanceId,
    pub(crate) ty: TypeHandle,
    pub(crate) config: Box<dyn Any + Send + Sync>,
    pub(crate) context: Mutex<ContextBox>,
    pub(crate) state: Mutex<NodeState>,
    /// 串行化回调的实例锁
    pub(crate) dispatch: ReentrantMutex<()>,
    /// 生命周期转换闸门：同一实例的打开/关闭/销毁依次进行
    pub(crate) transition: ReentrantMutex<()>,
    pub(crate) parent: Weak<InstanceNode>,
    pub(crate) endpoints: Vec<Endpoint>,
}

impl InstanceNode {
    pub(crate) fn type_name(&self) -> &str {
        self.ty.type_name()
    }

    pub(crate) fn lifecycle(&self) -> LifecycleState {
        self.state.lock().lifecycle
    }

    pub(crate) fn children(&self) -> Vec<Arc<InstanceNode>> {
        self.state.lock().children.clone()
    }

    pub(crate) fn handle(self: &Arc<Self>) -> ModuleHandle {
        ModuleHandle {
            id: self.id,
            node: Arc::downgrade(self),
        }
    }

    pub(crate) fn endpoint(&self, interface_id: InterfaceId, role: InterfaceRole) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|endpoint| endpoint.interface_id == interface_id && endpoint.role == role)
    }

    pub(crate) fn has_bindings(&self) -> bool {
        !self.state.lock().slots.is_empty()
    }

    /// 已提交绑定的反向链接（按绑定ID去重）
    pub(crate) fn binding_links(&self) -> Vec<Arc<dyn BindingLink>> {
        let state = self.state.lock();
        let mut links: Vec<Arc<dyn BindingLink>> = Vec::new();
        for slot in state.slots.values() {
            if let BindingSlot::Bound(link) = slot {
                if links.iter().all(|known| known.binding_id() != link.binding_id()) {
                    links.push(link.clone());
                }
            }
        }
        links
    }

    /// 按分发能力执行回调：串行类型持有实例锁，并发类型直接执行
    pub(crate) fn with_dispatch<R>(&self, f: impl FnOnce() -> R) -> R {
        match self.ty.descriptor().dispatch {
            DispatchMode::Serialized => {
                let _guard = self.dispatch.lock();
                f()
            }
            DispatchMode::Concurrent => f(),
        }
    }

    /// 叶子方法获取实例锁。实例进入Closing后放弃等待，
    /// 关闭回调可以安全地等待正在调用方法的后台工作结束。
    fn lock_for_method(&self) -> Result<Option<ReentrantMutexGuard<'_, ()>>> {
        if self.ty.descriptor().dispatch == DispatchMode::Concurrent {
            return Ok(None);
        }
        loop {
            if let Some(guard) = self.dispatch.try_lock_for(METHOD_LOCK_POLL) {
                return Ok(Some(guard));
            }
            if self.lifecycle() == LifecycleState::Closing {
                return Err(self.closing());
            }
        }
    }

    fn closing(&self) -> ModuleError {
        ModuleError::NotOpen {
            type_name: self.type_name().to_string(),
            state: LifecycleState::Closing.to_string(),
        }
    }
}

/// 模块句柄（非拥有）
#[derive(Clone)]
pub struct ModuleHandle {
    id: InstanceId,
    node: Weak<InstanceNode>,
}

impl ModuleHandle {
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// 实例是否仍然存在
    pub fn is_alive(&self) -> bool {
        self.node
            .upgrade()
            .map(|node| node.lifecycle() != LifecycleState::Destroyed)
            .unwrap_or(false)
    }

    /// 类型名称（实例已销毁时为None）
    pub fn type_name(&self) -> Option<String> {
        self.node.upgrade().map(|node| node.type_name().to_string())
    }

    /// 当前生命周期状态（实例已销毁时为None）
    pub fn state(&self) -> Option<LifecycleState> {
        self.node.upgrade().map(|node| node.lifecycle())
    }

    /// 是否为指定类型的实例
    pub fn is_type(&self, expected: &TypeHandle) -> bool {
        self.node
            .upgrade()
            .map(|node| node.ty == *expected)
            .unwrap_or(false)
    }

    pub(crate) fn from_weak(id: InstanceId, node: Weak<InstanceNode>) -> Self {
        Self { id, node }
    }

    pub(crate) fn upgrade(&self) -> Result<Arc<InstanceNode>> {
        self.node
            .upgrade()
            .filter(|node| node.lifecycle() != LifecycleState::Destroyed)
            .ok_or_else(|| {
                ModuleError::invalid_parameter(format!("instance {} no longer exists", self.id))
            })
    }

    /// 叶子模块方法约定：校验句柄类型和Open状态后再访问上下文。
    /// 违反约定属于编程误用；与关闭竞争（实例处于Closing）时返回`NotOpen`，不视为误用。
    pub fn method<R>(
        &self,
        expected: &TypeHandle,
        f: impl FnOnce(&ModuleContext<'_>) -> Result<R>,
    ) -> Result<R> {
        let node = self.upgrade().map_err(misuse)?;
        if node.ty != *expected {
            return Err(misuse(ModuleError::invalid_parameter(format!(
                "instance {} is a '{}', expected '{}'",
                self.id,
                node.type_name(),
                expected.type_name()
            ))));
        }

        let _guard = node.lock_for_method()?;
        match node.lifecycle() {
            LifecycleState::Open => f(&ModuleContext::new(&node)),
            LifecycleState::Closing => Err(node.closing()),
            state => Err(misuse(ModuleError::NotOpen {
                type_name: node.type_name().to_string(),
                state: state.to_string(),
            })),
        }
    }

    /// 直接操作私有上下文的方法
    pub fn invoke<C, R>(&self, expected: &TypeHandle, f: impl FnOnce(&mut C) -> R) -> Result<R>
    where
        C: Send + 'static,
    {
        self.method(expected, |ctx| {
            let mut context = ctx.context::<C>()?;
            Ok(f(&mut *context))
        })
    }
}

impl PartialEq for ModuleHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ModuleHandle {}

impl std::hash::Hash for ModuleHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// 回调上下文
pub struct ModuleContext<'a> {
    node: &'a Arc<InstanceNode>,
}

impl<'a> ModuleContext<'a> {
    pub(crate) fn new(node: &'a Arc<InstanceNode>) -> Self {
        Self { node }
    }

    pub fn id(&self) -> InstanceId {
        self.node.id
    }

    pub fn handle(&self) -> ModuleHandle {
        self.node.handle()
    }

    pub fn type_name(&self) -> &str {
        self.node.type_name()
    }

    pub fn state(&self) -> LifecycleState {
        self.node.lifecycle()
    }

    /// 父实例句柄
    pub fn parent(&self) -> Option<ModuleHandle> {
        self.node.parent.upgrade().map(|parent| parent.handle())
    }

    /// 子实例句柄（按注册顺序）
    pub fn children(&self) -> Vec<ModuleHandle> {
        self.node.children().iter().map(|child| child.handle()).collect()
    }

    /// 实例配置
    pub fn config<Cfg: 'static>(&self) -> Result<&'a Cfg> {
        let node: &'a InstanceNode = self.node;
        node.config.downcast_ref::<Cfg>().ok_or_else(|| {
            misuse(ModuleError::invalid_parameter(format!(
                "config of '{}' is not a {}",
                self.node.type_name(),
                std::any::type_name::<Cfg>()
            )))
        })
    }

    /// 私有上下文。守卫应尽快释放，不要跨越等待其他线程的操作持有。
    pub fn context<C: 'static>(&self) -> Result<MappedMutexGuard<'a, C>> {
        let node: &'a InstanceNode = self.node;
        MutexGuard::try_map(node.context.lock(), |context| context.downcast_mut::<C>())
            .map_err(|_| {
                misuse(ModuleError::invalid_parameter(format!(
                    "context of '{}' is not a {}",
                    self.node.type_name(),
                    std::any::type_name::<C>()
                )))
            })
    }
}

/// 子模块构建器，在ChildModulesAdd回调期间使用
pub struct ChildBuilder<'a> {
    tree: &'a InstanceTree,
    parent: &'a Arc<InstanceNode>,
    pub(crate) children: Vec<Arc<InstanceNode>>,
}

impl<'a> ChildBuilder<'a> {
    pub(crate) fn new(tree: &'a InstanceTree, parent: &'a Arc<InstanceNode>) -> Self {
        Self {
            tree,
            parent,
            children: Vec::new(),
        }
    }

    /// 注册一个子模块；子模块的子树在返回前递归构造完成
    pub fn add<Cfg>(&mut self, ty: &TypeHandle, config: Cfg) -> Result<ModuleHandle>
    where
        Cfg: Send + Sync + 'static,
    {
        let node = self
            .tree
            .construct(ty, Arc::downgrade(self.parent), Box::new(config))
            .map_err(|e| ModuleError::ChildConstructionFailed {
                type_name: ty.type_name().to_string(),
                source: Box::new(e),
            })?;

        let handle = node.handle();
        self.children.push(node);
        Ok(handle)
    }

    /// 已注册的子模块数量
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

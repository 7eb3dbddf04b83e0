//! 模块描述符与类型注册表
//!
//! 描述符是模块"类型"的静态、不可变描述：上下文大小、回调分发能力、
//! 打开策略、回调表以及声明的接口。注册表在启动时填充，之后只读。

use super::binding::{Interface, InterfaceDescriptor, InterfaceRole, Protocol, Transport};
use super::instance::{ChildBuilder, ModuleContext, ModuleHandle};
use crate::types::HostEvent;
use crate::{ModuleError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use semver::{Version, VersionReq};
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// 实例私有上下文（类型擦除）
pub type ContextBox = Box<dyn Any + Send>;

/// 上下文工厂：由配置创建私有上下文
pub type ContextFactory = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Result<ContextBox> + Send + Sync>;

/// 子模块注册回调
pub type ChildModulesAddFn =
    Arc<dyn Fn(&ModuleContext<'_>, &mut ChildBuilder<'_>) -> Result<()> + Send + Sync>;

/// 打开回调
pub type OpenFn = Arc<dyn Fn(&ModuleContext<'_>) -> Result<()> + Send + Sync>;

/// 关闭回调。返回前必须刷新或取消打开期间启动的所有工作
pub type CloseFn = Arc<dyn Fn(&ModuleContext<'_>) + Send + Sync>;

/// 宿主事件通知回调
pub type NotifyFn = Arc<dyn Fn(&ModuleContext<'_>, HostEvent) -> Result<()> + Send + Sync>;

/// 销毁回调（上下文释放前的清理）
pub type DestroyFn = Arc<dyn Fn(&ModuleContext<'_>) + Send + Sync>;

/// 接口端点工厂：为新实例创建协议端或传输端对象
pub(crate) type EndpointFactory =
    Arc<dyn Fn(&ModuleHandle) -> Arc<dyn Any + Send + Sync> + Send + Sync>;

/// 回调分发能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchMode {
    /// 同一实例的回调串行执行（由实例锁保证）
    Serialized,
    /// 回调可以与自身并发执行
    Concurrent,
}

/// 打开策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenOption {
    /// 根实例树构造完成后立即打开
    OnCreate,
    /// 收到PrepareHardware时打开，ReleaseHardware时关闭
    OnPrepareHardware,
    /// 收到D0Entry时打开，D0Exit时关闭
    OnD0Entry,
    /// 只在显式OpenInstance时打开
    Manual,
}

impl OpenOption {
    /// 此宿主事件是否驱动该策略的打开/关闭
    pub fn matches(&self, event: HostEvent) -> bool {
        match self {
            Self::OnPrepareHardware => {
                matches!(event, HostEvent::PrepareHardware | HostEvent::ReleaseHardware)
            }
            Self::OnD0Entry => matches!(event, HostEvent::D0Entry | HostEvent::D0Exit),
            Self::OnCreate | Self::Manual => false,
        }
    }
}

/// 回调表
#[derive(Clone, Default)]
pub struct ModuleCallbacks {
    pub child_modules_add: Option<ChildModulesAddFn>,
    pub open: Option<OpenFn>,
    pub close: Option<CloseFn>,
    pub notify: Option<NotifyFn>,
    pub destroy: Option<DestroyFn>,
}

impl fmt::Debug for ModuleCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCallbacks")
            .field("child_modules_add", &self.child_modules_add.is_some())
            .field("open", &self.open.is_some())
            .field("close", &self.close.is_some())
            .field("notify", &self.notify.is_some())
            .field("destroy", &self.destroy.is_some())
            .finish()
    }
}

/// 接口声明
#[derive(Clone)]
pub struct InterfaceDeclaration {
    pub(crate) interface: InterfaceDescriptor,
    pub(crate) role: InterfaceRole,
    pub(crate) requirement: Option<VersionReq>,
    pub(crate) factory: EndpointFactory,
}

impl InterfaceDeclaration {
    pub fn interface(&self) -> &InterfaceDescriptor {
        &self.interface
    }

    pub fn role(&self) -> InterfaceRole {
        self.role
    }
}

impl fmt::Debug for InterfaceDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceDeclaration")
            .field("interface", &self.interface)
            .field("role", &self.role)
            .field("requirement", &self.requirement)
            .finish()
    }
}

/// 模块描述符
pub struct ModuleDescriptor {
    /// 类型名称
    pub type_name: String,
    /// 类型版本
    pub version: Version,
    /// 上下文大小（字节）
    pub context_size: usize,
    /// 上下文类型名称
    pub context_type: &'static str,
    /// 回调分发能力
    pub dispatch: DispatchMode,
    /// 打开策略
    pub open_option: OpenOption,
    /// 回调表
    pub callbacks: ModuleCallbacks,
    /// 声明的接口
    pub interfaces: Vec<InterfaceDeclaration>,
    pub(crate) context_factory: ContextFactory,
    pub(crate) config_check: Arc<dyn Fn(&(dyn Any + Send + Sync)) -> bool + Send + Sync>,
    pub(crate) config_type: &'static str,
}

impl ModuleDescriptor {
    /// 创建描述符构建器
    pub fn builder(type_name: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder::new(type_name)
    }

    /// 是否为无状态类型
    pub fn is_stateless(&self) -> bool {
        self.context_size == 0
    }

    /// 校验描述符
    pub fn validate(&self) -> Result<()> {
        if self.type_name.trim().is_empty() {
            return Err(ModuleError::invalid_descriptor(
                "<unnamed>",
                "type name cannot be empty",
            ));
        }

        // 打开回调只有在无状态类型上才可以缺省
        if !self.is_stateless() && self.callbacks.open.is_none() {
            return Err(ModuleError::invalid_descriptor(
                &self.type_name,
                format!(
                    "stateful type (context '{}', {} bytes) must provide an open callback",
                    self.context_type, self.context_size
                ),
            ));
        }

        if self.callbacks.close.is_some() && self.callbacks.open.is_none() {
            return Err(ModuleError::invalid_descriptor(
                &self.type_name,
                "close callback without an open callback",
            ));
        }

        for (index, declaration) in self.interfaces.iter().enumerate() {
            let duplicated = self.interfaces[..index].iter().any(|other| {
                other.interface.id == declaration.interface.id && other.role == declaration.role
            });
            if duplicated {
                return Err(ModuleError::invalid_descriptor(
                    &self.type_name,
                    format!(
                        "interface '{}' declared twice as {:?}",
                        declaration.interface.name, declaration.role
                    ),
                ));
            }
        }

        Ok(())
    }

    pub(crate) fn accepts_config(&self, config: &(dyn Any + Send + Sync)) -> bool {
        (self.config_check)(config)
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("type_name", &self.type_name)
            .field("version", &self.version)
            .field("context_size", &self.context_size)
            .field("dispatch", &self.dispatch)
            .field("open_option", &self.open_option)
            .field("callbacks", &self.callbacks)
            .field("interfaces", &self.interfaces)
            .finish()
    }
}

/// 描述符构建器
pub struct DescriptorBuilder {
    descriptor: ModuleDescriptor,
}

impl DescriptorBuilder {
    fn new(type_name: impl Into<String>) -> Self {
        Self {
            descriptor: ModuleDescriptor {
                type_name: type_name.into(),
                version: Version::new(1, 0, 0),
                context_size: 0,
                context_type: std::any::type_name::<()>(),
                dispatch: DispatchMode::Serialized,
                open_option: OpenOption::Manual,
                callbacks: ModuleCallbacks::default(),
                interfaces: Vec::new(),
                context_factory: Arc::new(|_: &(dyn Any + Send + Sync)| Ok(Box::new(()) as ContextBox)),
                config_check: Arc::new(|_: &(dyn Any + Send + Sync)| true),
                config_type: "any",
            },
        }
    }

    /// 设置类型版本
    pub fn version(mut self, version: Version) -> Self {
        self.descriptor.version = version;
        self
    }

    /// 设置回调分发能力
    pub fn dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.descriptor.dispatch = dispatch;
        self
    }

    /// 设置打开策略
    pub fn open_option(mut self, open_option: OpenOption) -> Self {
        self.descriptor.open_option = open_option;
        self
    }

    /// 声明私有上下文类型和配置类型
    pub fn context<C, Cfg, F>(mut self, factory: F) -> Self
    where
        C: Send + 'static,
        Cfg: Send + Sync + 'static,
        F: Fn(&Cfg) -> Result<C> + Send + Sync + 'static,
    {
        self.descriptor.context_size = std::mem::size_of::<C>();
        self.descriptor.context_type = std::any::type_name::<C>();
        self.descriptor.config_type = std::any::type_name::<Cfg>();
        self.descriptor.config_check = Arc::new(|config: &(dyn Any + Send + Sync)| config.is::<Cfg>());
        self.descriptor.context_factory = Arc::new(move |config: &(dyn Any + Send + Sync)| {
            let config = config.downcast_ref::<Cfg>().ok_or_else(|| {
                ModuleError::invalid_parameter(format!(
                    "config is not a {}",
                    std::any::type_name::<Cfg>()
                ))
            })?;
            Ok(Box::new(factory(config)?) as ContextBox)
        });
        self
    }

    /// 使用Default初始化的上下文，接受任意配置
    pub fn default_context<C>(mut self) -> Self
    where
        C: Default + Send + 'static,
    {
        self.descriptor.context_size = std::mem::size_of::<C>();
        self.descriptor.context_type = std::any::type_name::<C>();
        self.descriptor.context_factory =
            Arc::new(|_: &(dyn Any + Send + Sync)| Ok(Box::new(C::default()) as ContextBox));
        self
    }

    /// 子模块注册回调
    pub fn child_modules_add<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ModuleContext<'_>, &mut ChildBuilder<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.descriptor.callbacks.child_modules_add = Some(Arc::new(callback));
        self
    }

    /// 打开回调
    pub fn on_open<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ModuleContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.descriptor.callbacks.open = Some(Arc::new(callback));
        self
    }

    /// 关闭回调
    pub fn on_close<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ModuleContext<'_>) + Send + Sync + 'static,
    {
        self.descriptor.callbacks.close = Some(Arc::new(callback));
        self
    }

    /// 宿主事件通知回调
    pub fn on_notify<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ModuleContext<'_>, HostEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.descriptor.callbacks.notify = Some(Arc::new(callback));
        self
    }

    /// 销毁回调
    pub fn on_destroy<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ModuleContext<'_>) + Send + Sync + 'static,
    {
        self.descriptor.callbacks.destroy = Some(Arc::new(callback));
        self
    }

    /// 声明协议端
    pub fn protocol<I, P, F>(mut self, requirement: VersionReq, factory: F) -> Self
    where
        I: Interface,
        P: Protocol<I>,
        F: Fn(&ModuleHandle) -> P + Send + Sync + 'static,
    {
        self.descriptor.interfaces.push(InterfaceDeclaration {
            interface: I::descriptor().clone(),
            role: InterfaceRole::Protocol,
            requirement: Some(requirement),
            factory: Arc::new(move |handle: &ModuleHandle| {
                let endpoint: Arc<dyn Protocol<I>> = Arc::new(factory(handle));
                Arc::new(endpoint) as Arc<dyn Any + Send + Sync>
            }),
        });
        self
    }

    /// 声明传输端
    pub fn transport<I, T, F>(mut self, factory: F) -> Self
    where
        I: Interface,
        T: Transport<I>,
        F: Fn(&ModuleHandle) -> T + Send + Sync + 'static,
    {
        self.descriptor.interfaces.push(InterfaceDeclaration {
            interface: I::descriptor().clone(),
            role: InterfaceRole::Transport,
            requirement: None,
            factory: Arc::new(move |handle: &ModuleHandle| {
                let endpoint: Arc<dyn Transport<I>> = Arc::new(factory(handle));
                Arc::new(endpoint) as Arc<dyn Any + Send + Sync>
            }),
        });
        self
    }

    /// 完成构建
    pub fn build(self) -> ModuleDescriptor {
        self.descriptor
    }
}

/// 类型句柄：不透明、可比较
#[derive(Clone)]
pub struct TypeHandle {
    key: u32,
    descriptor: Arc<ModuleDescriptor>,
}

impl TypeHandle {
    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn type_name(&self) -> &str {
        &self.descriptor.type_name
    }
}

impl PartialEq for TypeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && Arc::ptr_eq(&self.descriptor, &other.descriptor)
    }
}

impl Eq for TypeHandle {}

impl Hash for TypeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for TypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeHandle({}, {})", self.key, self.descriptor.type_name)
    }
}

/// 描述符注册表
pub struct DescriptorRegistry {
    types: DashMap<String, TypeHandle>,
    next_key: AtomicU32,
    sealed: AtomicBool,
}

impl DescriptorRegistry {
    /// 创建新的注册表
    pub fn new() -> Self {
        Self {
            types: DashMap::new(),
            next_key: AtomicU32::new(1),
            sealed: AtomicBool::new(false),
        }
    }

    /// 注册模块类型
    pub fn register_type(&self, descriptor: ModuleDescriptor) -> Result<TypeHandle> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(ModuleError::invalid_descriptor(
                &descriptor.type_name,
                "registry is sealed",
            ));
        }

        descriptor.validate()?;

        let type_name = descriptor.type_name.clone();
        let handle = match self.types.entry(type_name.clone()) {
            Entry::Occupied(_) => {
                return Err(ModuleError::invalid_descriptor(
                    &type_name,
                    "type already registered",
                ));
            }
            Entry::Vacant(vacant) => {
                let handle = TypeHandle {
                    key: self.next_key.fetch_add(1, Ordering::Relaxed),
                    descriptor: Arc::new(descriptor),
                };
                vacant.insert(handle.clone());
                handle
            }
        };

        debug!(
            type_name = %type_name,
            context_size = handle.descriptor.context_size,
            interfaces = handle.descriptor.interfaces.len(),
            "Module type registered"
        );
        Ok(handle)
    }

    /// 按名称查找类型
    pub fn lookup(&self, type_name: &str) -> Option<TypeHandle> {
        self.types.get(type_name).map(|entry| entry.value().clone())
    }

    /// 封存注册表，此后不再接受注册
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
        info!("Descriptor registry sealed with {} types", self.types.len());
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for DescriptorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

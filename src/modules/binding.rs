//! 接口契约与绑定解析器
//!
//! 一个契约由全局唯一的接口标识定义，分为两侧：
//! - 协议端（Protocol）：能力的消费者，提供绑定数据
//! - 传输端（Transport）：能力的实现者，提供契约方法
//!
//! 绑定采用两阶段提交：先在两端预留占位，再依次调用Bind和PostBind，
//! 任一步失败都会回滚，调用方永远看不到半建立的绑定。

use super::instance::{BindingLink, BindingSlot, InstanceNode, ModuleHandle};
use super::tree::InstanceTree;
use crate::core::events::{LifecycleEventBus, LifecycleEventKind};
use crate::types::{now_ns, BindingId, InstanceId, InterfaceId, TimestampNs};
use crate::{ModuleError, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 接口描述符
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    /// 契约标识
    pub id: InterfaceId,
    /// 契约名称（诊断用）
    pub name: &'static str,
    /// 契约版本
    pub version: Version,
}

impl InterfaceDescriptor {
    pub fn new(id: InterfaceId, name: &'static str, version: Version) -> Self {
        Self { id, name, version }
    }
}

/// 接口端点角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceRole {
    Protocol,
    Transport,
}

/// 接口契约
///
/// 由标记类型实现，关联协议端和传输端交换的数据以及契约方法集合。
pub trait Interface: Send + Sync + 'static {
    /// 传输端提供的方法集合（通常是trait对象）
    type Methods: ?Sized + Send + Sync + 'static;
    /// 协议端提供的绑定数据
    type ProtocolData: Send + Sync + 'static;
    /// 传输端提供的绑定数据
    type TransportData: Send + Sync + 'static;

    /// 契约描述符
    fn descriptor() -> &'static InterfaceDescriptor;
}

/// 协议端回调
pub trait Protocol<I: Interface>: Send + Sync + 'static {
    /// 绑定时交给传输端的数据
    fn bind_data(&self) -> I::ProtocolData;

    /// 传输端绑定成功后调用；失败会回滚整个绑定。
    /// 本回调成功而传输端PostBind随后失败时，传输端Unbind之后会调用`unbound`。
    fn post_bind(&self, _transport: &I::TransportData) -> Result<()> {
        Ok(())
    }

    /// 解绑开始前调用
    fn pre_unbind(&self) {}

    /// 解绑完成后调用；绑定在本端PostBind成功之后回滚时也会调用
    fn unbound(&self) {}
}

/// 传输端回调
pub trait Transport<I: Interface>: Send + Sync + 'static {
    /// 接受协议端数据，返回传输端数据
    fn bind(&self, protocol: &I::ProtocolData) -> Result<I::TransportData>;

    /// 释放绑定占用的资源
    fn unbind(&self, data: &I::TransportData);

    /// 协议端PostBind成功后调用；失败会回滚整个绑定
    fn post_bind(&self) -> Result<()> {
        Ok(())
    }

    /// 解绑开始前调用
    fn pre_unbind(&self) {}

    /// 契约方法
    fn methods(&self) -> Arc<I::Methods>;
}

struct ActiveBinding<I: Interface> {
    protocol: Arc<dyn Protocol<I>>,
    transport: Arc<dyn Transport<I>>,
    methods: Arc<I::Methods>,
    protocol_data: I::ProtocolData,
    transport_data: I::TransportData,
}

struct BindingRecord<I: Interface> {
    id: BindingId,
    protocol: ModuleHandle,
    transport: ModuleHandle,
    bound_at: TimestampNs,
    state: RwLock<Option<ActiveBinding<I>>>,
}

impl<I: Interface> BindingRecord<I> {
    /// 拆除绑定：PreUnbind（协议端、传输端），传输端Unbind，最后通知协议端。
    /// 先在写锁下取走绑定状态，进行中的调用结束后才开始拆除。
    fn dissolve(
        &self,
        active: &DashMap<BindingId, BindingInfo>,
        events: &LifecycleEventBus,
    ) -> Result<()> {
        let interface = I::descriptor();
        let binding = self
            .state
            .write()
            .take()
            .ok_or_else(|| ModuleError::NotBound {
                interface: interface.name.to_string(),
            })?;

        let protocol_node = self.protocol.upgrade().ok();
        let transport_node = self.transport.upgrade().ok();

        dispatch_on(&protocol_node, || binding.protocol.pre_unbind());
        dispatch_on(&transport_node, || binding.transport.pre_unbind());
        dispatch_on(&transport_node, || {
            binding.transport.unbind(&binding.transport_data)
        });
        dispatch_on(&protocol_node, || binding.protocol.unbound());

        for (node, role) in [
            (&protocol_node, InterfaceRole::Protocol),
            (&transport_node, InterfaceRole::Transport),
        ] {
            if let Some(node) = node {
                release(node, interface, role);
                let kind = LifecycleEventKind::Unbound {
                    interface: interface.name.to_string(),
                };
                events.publish(node.id, node.type_name(), kind);
            }
        }
        active.remove(&self.id);

        info!(binding = %self.id, interface = interface.name, "Interface unbound");
        Ok(())
    }
}

/// 端点占位里保存的绑定链接
struct SlotLink<I: Interface> {
    record: Arc<BindingRecord<I>>,
    active: Arc<DashMap<BindingId, BindingInfo>>,
    events: LifecycleEventBus,
}

impl<I: Interface> BindingLink for SlotLink<I> {
    fn binding_id(&self) -> BindingId {
        self.record.id
    }

    fn sever(&self) {
        if self.record.dissolve(&self.active, &self.events).is_ok() {
            warn!(
                binding = %self.record.id,
                interface = I::descriptor().name,
                "Binding severed by instance teardown"
            );
        }
    }
}

/// 绑定
///
/// 解绑后通过旧绑定发起的调用一律返回`NotBound`。
pub struct Binding<I: Interface> {
    inner: Arc<BindingRecord<I>>,
}

impl<I: Interface> Binding<I> {
    pub fn id(&self) -> BindingId {
        self.inner.id
    }

    pub fn interface(&self) -> &'static InterfaceDescriptor {
        I::descriptor()
    }

    /// 协议端实例
    pub fn protocol(&self) -> &ModuleHandle {
        &self.inner.protocol
    }

    /// 传输端实例
    pub fn transport(&self) -> &ModuleHandle {
        &self.inner.transport
    }

    pub fn bound_at(&self) -> TimestampNs {
        self.inner.bound_at
    }

    pub fn is_bound(&self) -> bool {
        self.inner.state.read().is_some()
    }

    /// 通过绑定调用契约方法。
    /// 调用期间持有绑定的读锁，解绑会等待进行中的调用结束；
    /// 回调内不得解绑同一个绑定。
    pub fn call<R>(&self, f: impl FnOnce(&I::Methods, &I::TransportData) -> R) -> Result<R> {
        let state = self.inner.state.read();
        let active = state.as_ref().ok_or_else(|| ModuleError::NotBound {
            interface: I::descriptor().name.to_string(),
        })?;
        Ok(f(&*active.methods, &active.transport_data))
    }

    /// 读取协议端绑定数据
    pub fn with_protocol_data<R>(&self, f: impl FnOnce(&I::ProtocolData) -> R) -> Result<R> {
        let state = self.inner.state.read();
        let active = state.as_ref().ok_or_else(|| ModuleError::NotBound {
            interface: I::descriptor().name.to_string(),
        })?;
        Ok(f(&active.protocol_data))
    }
}

impl<I: Interface> Clone for Binding<I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I: Interface> fmt::Debug for Binding<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("id", &self.inner.id)
            .field("interface", &I::descriptor().name)
            .field("protocol", &self.inner.protocol.id())
            .field("transport", &self.inner.transport.id())
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// 活动绑定摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingInfo {
    pub id: BindingId,
    pub interface: String,
    pub protocol: InstanceId,
    pub transport: InstanceId,
    pub bound_at: TimestampNs,
}

/// 绑定解析器
pub struct BindingResolver {
    events: LifecycleEventBus,
    active: Arc<DashMap<BindingId, BindingInfo>>,
}

impl BindingResolver {
    /// 创建解析器，事件发布到实例树的事件总线
    pub fn new(tree: &InstanceTree) -> Self {
        Self::with_events(tree.events().clone())
    }

    pub fn with_events(events: LifecycleEventBus) -> Self {
        Self {
            events,
            active: Arc::new(DashMap::new()),
        }
    }

    /// 绑定协议端实例和传输端实例
    pub fn bind<I: Interface>(
        &self,
        protocol: &ModuleHandle,
        transport: &ModuleHandle,
    ) -> Result<Binding<I>> {
        let interface = I::descriptor();
        let protocol_node = protocol.upgrade()?;
        let transport_node = transport.upgrade()?;

        let protocol_endpoint = protocol_node
            .endpoint(interface.id, InterfaceRole::Protocol)
            .ok_or_else(|| {
                mismatch(
                    interface,
                    format!("'{}' does not declare a protocol endpoint", protocol_node.type_name()),
                )
            })?;
        let transport_endpoint = transport_node
            .endpoint(interface.id, InterfaceRole::Transport)
            .ok_or_else(|| {
                mismatch(
                    interface,
                    format!("'{}' does not declare a transport endpoint", transport_node.type_name()),
                )
            })?;

        if let Some(requirement) = &protocol_endpoint.requirement {
            if !requirement.matches(&transport_endpoint.version) {
                return Err(mismatch(
                    interface,
                    format!(
                        "transport '{}' implements {} but protocol '{}' requires {}",
                        transport_node.type_name(),
                        transport_endpoint.version,
                        protocol_node.type_name(),
                        requirement
                    ),
                ));
            }
        }

        // 标识冲突：同一标识被两个不同的契约类型使用
        let protocol_object = protocol_endpoint
            .object
            .downcast_ref::<Arc<dyn Protocol<I>>>()
            .cloned()
            .ok_or_else(|| {
                mismatch(interface, "protocol endpoint implements a different contract with the same identity")
            })?;
        let transport_object = transport_endpoint
            .object
            .downcast_ref::<Arc<dyn Transport<I>>>()
            .cloned()
            .ok_or_else(|| {
                mismatch(interface, "transport endpoint implements a different contract with the same identity")
            })?;

        reserve(&protocol_node, interface, InterfaceRole::Protocol)?;
        if let Err(e) = reserve(&transport_node, interface, InterfaceRole::Transport) {
            release(&protocol_node, interface, InterfaceRole::Protocol);
            return Err(e);
        }

        let protocol_data = protocol_node.with_dispatch(|| protocol_object.bind_data());
        let transport_data =
            match transport_node.with_dispatch(|| transport_object.bind(&protocol_data)) {
                Ok(data) => data,
                Err(e) => {
                    release(&transport_node, interface, InterfaceRole::Transport);
                    release(&protocol_node, interface, InterfaceRole::Protocol);
                    warn!(interface = interface.name, "Transport bind failed: {}", e);
                    return Err(e);
                }
            };

        // 错误附带协议端PostBind是否已经成功
        let post_bind = match protocol_node
            .with_dispatch(|| protocol_object.post_bind(&transport_data))
        {
            Ok(()) => transport_node
                .with_dispatch(|| transport_object.post_bind())
                .map_err(|e| (e, true)),
            Err(e) => Err((e, false)),
        };
        if let Err((e, protocol_accepted)) = post_bind {
            transport_node.with_dispatch(|| transport_object.unbind(&transport_data));
            if protocol_accepted {
                protocol_node.with_dispatch(|| protocol_object.unbound());
            }
            release(&transport_node, interface, InterfaceRole::Transport);
            release(&protocol_node, interface, InterfaceRole::Protocol);
            let kind = LifecycleEventKind::BindRolledBack {
                interface: interface.name.to_string(),
            };
            self.events
                .publish(protocol_node.id, protocol_node.type_name(), kind);
            warn!(
                interface = interface.name,
                protocol = %protocol_node.id,
                transport = %transport_node.id,
                "PostBind failed, binding rolled back: {}",
                e
            );
            return Err(ModuleError::BindRolledBack {
                interface: interface.name.to_string(),
                source: Box::new(e),
            });
        }

        let id = BindingId::next();
        let methods = transport_object.methods();
        let record = Arc::new(BindingRecord {
            id,
            protocol: protocol.clone(),
            transport: transport.clone(),
            bound_at: now_ns(),
            state: RwLock::new(Some(ActiveBinding {
                protocol: protocol_object,
                transport: transport_object,
                methods,
                protocol_data,
                transport_data,
            })),
        });
        let link: Arc<dyn BindingLink> = Arc::new(SlotLink {
            record: record.clone(),
            active: self.active.clone(),
            events: self.events.clone(),
        });
        commit(&protocol_node, interface, InterfaceRole::Protocol, link.clone());
        commit(&transport_node, interface, InterfaceRole::Transport, link);

        self.active.insert(
            id,
            BindingInfo {
                id,
                interface: interface.name.to_string(),
                protocol: protocol_node.id,
                transport: transport_node.id,
                bound_at: record.bound_at,
            },
        );

        for node in [&protocol_node, &transport_node] {
            let kind = LifecycleEventKind::Bound {
                interface: interface.name.to_string(),
            };
            self.events.publish(node.id, node.type_name(), kind);
        }
        info!(
            binding = %id,
            interface = interface.name,
            protocol = %protocol_node.id,
            transport = %transport_node.id,
            "Interface bound"
        );

        Ok(Binding { inner: record })
    }

    /// 解除绑定：PreUnbind（协议端、传输端），传输端Unbind，最后通知协议端
    pub fn unbind<I: Interface>(&self, binding: &Binding<I>) -> Result<()> {
        binding.inner.dissolve(&self.active, &self.events)
    }

    /// 协议端实例当前是否已绑定（预留中的绑定不算）
    pub fn is_bound<I: Interface>(&self, protocol: &ModuleHandle) -> bool {
        let Ok(node) = protocol.upgrade() else {
            return false;
        };
        let state = node.state.lock();
        matches!(
            state.slots.get(&(I::descriptor().id, InterfaceRole::Protocol)),
            Some(BindingSlot::Bound(_))
        )
    }

    /// 当前活动绑定
    pub fn active_bindings(&self) -> Vec<BindingInfo> {
        let mut bindings: Vec<BindingInfo> =
            self.active.iter().map(|entry| entry.value().clone()).collect();
        bindings.sort_by_key(|info| info.bound_at);
        bindings
    }

    /// 按外部选择器挑选传输端候选；越界选择器是配置错误，不回退到默认值
    pub fn select_transport<'c>(
        &self,
        candidates: &'c [ModuleHandle],
        selector: u32,
    ) -> Result<&'c ModuleHandle> {
        candidates.get(selector as usize).ok_or_else(|| {
            ModuleError::config(format!(
                "transport selector {} is out of range ({} candidates)",
                selector,
                candidates.len()
            ))
        })
    }

    /// 按选择器挑选传输端并绑定
    pub fn bind_selected<I: Interface>(
        &self,
        protocol: &ModuleHandle,
        candidates: &[ModuleHandle],
        selector: u32,
    ) -> Result<Binding<I>> {
        let transport = self.select_transport(candidates, selector)?;
        debug!(
            interface = I::descriptor().name,
            selector,
            transport = %transport.id(),
            "Transport selected"
        );
        self.bind(protocol, transport)
    }
}

fn mismatch(interface: &InterfaceDescriptor, message: impl Into<String>) -> ModuleError {
    ModuleError::InterfaceMismatch {
        interface: interface.name.to_string(),
        message: message.into(),
    }
}

fn reserve(node: &InstanceNode, interface: &InterfaceDescriptor, role: InterfaceRole) -> Result<()> {
    let mut state = node.state.lock();
    match state.slots.entry((interface.id, role)) {
        Entry::Occupied(_) => Err(ModuleError::AlreadyBound {
            instance: node.id.to_string(),
            interface: interface.name.to_string(),
        }),
        Entry::Vacant(vacant) => {
            vacant.insert(BindingSlot::Reserved);
            Ok(())
        }
    }
}

fn commit(
    node: &InstanceNode,
    interface: &InterfaceDescriptor,
    role: InterfaceRole,
    link: Arc<dyn BindingLink>,
) {
    node.state
        .lock()
        .slots
        .insert((interface.id, role), BindingSlot::Bound(link));
}

fn release(node: &InstanceNode, interface: &InterfaceDescriptor, role: InterfaceRole) {
    node.state.lock().slots.remove(&(interface.id, role));
}

fn dispatch_on<R>(node: &Option<Arc<InstanceNode>>, f: impl FnOnce() -> R) -> R {
    match node {
        Some(node) => node.with_dispatch(f),
        None => f(),
    }
}

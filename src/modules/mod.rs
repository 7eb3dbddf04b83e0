//! 模块组合与生命周期引擎
//!
//! 描述符注册表、实例树、生命周期状态机、绑定解析器和宿主事件泵

pub mod binding;
pub mod descriptor;
pub mod host;
pub mod instance;
pub mod lifecycle;
pub mod tree;

pub use binding::{
    Binding, BindingInfo, BindingResolver, Interface, InterfaceDescriptor, InterfaceRole, Protocol,
    Transport,
};
pub use descriptor::{
    DescriptorBuilder, DescriptorRegistry, DispatchMode, InterfaceDeclaration, ModuleCallbacks,
    ModuleDescriptor, OpenOption, TypeHandle,
};
pub use host::{HostEventPump, HostEventSource};
pub use instance::{ChildBuilder, ModuleContext, ModuleHandle};
pub use lifecycle::LifecycleState;
pub use tree::InstanceTree;

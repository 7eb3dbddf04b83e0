//! ModuleFabric 主程序 - 配置驱动的演示设备
//!
//! 组装一棵设备实例树：传感器协议端 + 两个可选传输端，
//! 按配置中的选择器绑定传输端，并模拟一次上电/采样/断电过程。

use anyhow::Context;
use module_fabric::config::{generate_default_config_file, ConfigManager, DispatcherConfig};
use module_fabric::core::events::drain;
use module_fabric::{
    initialize, Binding, BindingResolver, CoalescingDispatcher, DescriptorRegistry, HostEvent,
    HostEventPump, InstanceTree, Interface, InterfaceDescriptor, InterfaceId, LifecycleState,
    ModuleDescriptor, ModuleError, ModuleHandle, OpenOption, Protocol, Transport, TypeHandle,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use semver::{Version, VersionReq};
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const SENSOR_BUS_ID: InterfaceId = InterfaceId::from_u128(0x6d66_5345_4e53_4f52_4255_5300_0000_0001);
const DEFAULT_CONFIG: &str = "module_fabric.yaml";

/// 传感器总线契约方法
trait SensorBusMethods: Send + Sync {
    fn read(&self, register: u8) -> module_fabric::Result<u16>;
}

/// 传感器总线契约
struct SensorBus;

impl Interface for SensorBus {
    type Methods = dyn SensorBusMethods;
    /// 协议端名称
    type ProtocolData = String;
    /// 传输端分配的通道号
    type TransportData = u32;

    fn descriptor() -> &'static InterfaceDescriptor {
        static DESCRIPTOR: Lazy<InterfaceDescriptor> = Lazy::new(|| {
            InterfaceDescriptor::new(SENSOR_BUS_ID, "SensorBus", Version::new(1, 0, 0))
        });
        &DESCRIPTOR
    }
}

/// 设备根配置
struct DeviceConfig {
    dispatcher: DispatcherConfig,
    register: u8,
}

/// 传感器配置
struct SensorConfig {
    dispatcher: DispatcherConfig,
    register: u8,
}

/// 采样器与回调共享的状态
struct SamplerShared {
    register: u8,
    binding: Mutex<Option<Binding<SensorBus>>>,
    readings: Mutex<Vec<u16>>,
}

/// 传感器私有上下文
struct SensorState {
    shared: Arc<SamplerShared>,
    dispatcher: DispatcherConfig,
    sampler: Option<CoalescingDispatcher>,
}

struct SensorClient;

impl Protocol<SensorBus> for SensorClient {
    fn bind_data(&self) -> String {
        "SensorProtocol".to_string()
    }

    fn post_bind(&self, channel: &u32) -> module_fabric::Result<()> {
        tracing::info!("Sensor bound on channel {}", channel);
        Ok(())
    }
}

struct SimulatedBus;

struct SimulatedRegisters;

impl SensorBusMethods for SimulatedRegisters {
    fn read(&self, register: u8) -> module_fabric::Result<u16> {
        Ok(u16::from(register) * 3 + 1)
    }
}

impl Transport<SensorBus> for SimulatedBus {
    fn bind(&self, client: &String) -> module_fabric::Result<u32> {
        tracing::info!("Simulated bus accepting '{}'", client);
        Ok(1)
    }

    fn unbind(&self, channel: &u32) {
        tracing::info!("Simulated bus released channel {}", channel);
    }

    fn methods(&self) -> Arc<dyn SensorBusMethods> {
        Arc::new(SimulatedRegisters)
    }
}

struct LoopbackBus;

struct LoopbackRegisters;

impl SensorBusMethods for LoopbackRegisters {
    fn read(&self, register: u8) -> module_fabric::Result<u16> {
        Ok(u16::from(register))
    }
}

impl Transport<SensorBus> for LoopbackBus {
    fn bind(&self, client: &String) -> module_fabric::Result<u32> {
        tracing::info!("Loopback bus accepting '{}'", client);
        Ok(2)
    }

    fn unbind(&self, channel: &u32) {
        tracing::info!("Loopback bus released channel {}", channel);
    }

    fn methods(&self) -> Arc<dyn SensorBusMethods> {
        Arc::new(LoopbackRegisters)
    }
}

/// 演示设备的类型集合
struct DeviceTypes {
    root: TypeHandle,
    sensor: TypeHandle,
}

fn register_types(registry: &DescriptorRegistry) -> module_fabric::Result<DeviceTypes> {
    let requirement = VersionReq::parse("^1")
        .map_err(|e| ModuleError::invalid_descriptor("SensorProtocol", e.to_string()))?;
    let sensor = registry.register_type(
        ModuleDescriptor::builder("SensorProtocol")
            .open_option(OpenOption::OnD0Entry)
            .context::<SensorState, SensorConfig, _>(|config: &SensorConfig| {
                Ok(SensorState {
                    shared: Arc::new(SamplerShared {
                        register: config.register,
                        binding: Mutex::new(None),
                        readings: Mutex::new(Vec::new()),
                    }),
                    dispatcher: config.dispatcher.clone(),
                    sampler: None,
                })
            })
            .on_open(|ctx| {
                let mut state = ctx.context::<SensorState>()?;
                let shared = state.shared.clone();
                let sampler = CoalescingDispatcher::from_config(&state.dispatcher, "sensor", move || {
                    let binding = shared.binding.lock().clone();
                    let Some(binding) = binding else {
                        tracing::warn!("Sample requested while the sensor is unbound");
                        return;
                    };
                    match binding.call(|bus, _| bus.read(shared.register)) {
                        Ok(Ok(value)) => shared.readings.lock().push(value),
                        Ok(Err(e)) | Err(e) => tracing::warn!("Sample failed: {}", e),
                    }
                })?;
                state.sampler = Some(sampler);
                Ok(())
            })
            .on_close(|ctx| {
                let sampler = match ctx.context::<SensorState>() {
                    Ok(mut state) => state.sampler.take(),
                    Err(_) => None,
                };
                if let Some(sampler) = sampler {
                    sampler.shutdown();
                }
            })
            .protocol::<SensorBus, _, _>(requirement, |_: &ModuleHandle| SensorClient)
            .build(),
    )?;

    let simulated = registry.register_type(
        ModuleDescriptor::builder("SimulatedBus")
            .transport::<SensorBus, _, _>(|_: &ModuleHandle| SimulatedBus)
            .build(),
    )?;
    let loopback = registry.register_type(
        ModuleDescriptor::builder("LoopbackBus")
            .transport::<SensorBus, _, _>(|_: &ModuleHandle| LoopbackBus)
            .build(),
    )?;

    let sensor_ty = sensor.clone();
    let root = registry.register_type(
        ModuleDescriptor::builder("DeviceRoot")
            .context::<(), DeviceConfig, _>(|_: &DeviceConfig| Ok(()))
            .child_modules_add(move |ctx, children| {
                let config = ctx.config::<DeviceConfig>()?;
                children.add(
                    &sensor_ty,
                    SensorConfig {
                        dispatcher: config.dispatcher.clone(),
                        register: config.register,
                    },
                )?;
                children.add(&simulated, ())?;
                children.add(&loopback, ())?;
                Ok(())
            })
            .build(),
    )?;

    registry.seal();
    Ok(DeviceTypes { root, sensor })
}

/// 程序入口点
#[tokio::main]
async fn main() {
    if let Err(e) = run_main().await {
        tracing::error!("Run failed: {:#}", e);
        eprintln!("module_fabric: {:#}", e);
        std::process::exit(1);
    }
}

/// 主要逻辑函数
async fn run_main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("init") => {
            let path = args.get(2).map(String::as_str).unwrap_or(DEFAULT_CONFIG);
            generate_default_config_file(path)
                .await
                .with_context(|| format!("failed to write {}", path))?;
            println!("Generated default configuration at {}", path);
            Ok(())
        }
        Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some(path) => {
            let manager = ConfigManager::load_from_file(path)
                .await
                .with_context(|| format!("failed to load {}", path))?;
            run_device(manager).await
        }
        None if Path::new(DEFAULT_CONFIG).exists() => {
            let manager = ConfigManager::load_from_file(DEFAULT_CONFIG).await?;
            run_device(manager).await
        }
        None => {
            let mut manager = ConfigManager::new_default();
            manager
                .get_config_mut()
                .selectors
                .insert("SensorProtocol".to_string(), 0);
            run_device(manager).await
        }
    }
}

async fn run_device(manager: ConfigManager) -> anyhow::Result<()> {
    manager.validate()?;
    let config = manager.get_config();
    initialize(&config.logging);
    tracing::info!("Starting runtime '{}'", config.runtime.name);

    let registry = DescriptorRegistry::new();
    let types = register_types(&registry)?;
    let tree = Arc::new(InstanceTree::new(&config.runtime));
    let resolver = BindingResolver::new(&tree);
    let mut lifecycle = tree.subscribe();

    let root = tree.create_instance(
        &types.root,
        None,
        DeviceConfig {
            dispatcher: config.dispatcher.clone(),
            register: 7,
        },
    )?;
    let children = tree.children(&root)?;
    let (sensor, candidates) = children
        .split_first()
        .context("device root has no children")?;

    let pump = HostEventPump::new(tree.clone()).with_root(root.clone());
    let (events, source) = mpsc::channel(4);
    let pump_task = tokio::spawn(async move { pump.run(source).await });

    events.send(HostEvent::PrepareHardware).await?;
    events.send(HostEvent::D0Entry).await?;

    let selector = manager.selector("SensorProtocol")?;
    let binding = resolver.bind_selected::<SensorBus>(sensor, candidates, selector)?;
    tracing::info!(
        "Active bindings: {}",
        serde_json::to_string(&resolver.active_bindings())?
    );

    // 等待上电事件处理完成
    while tree.state(sensor)? != LifecycleState::Open {
        if pump_task.is_finished() {
            anyhow::bail!("host event pump stopped before the sensor opened");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    sensor.invoke(&types.sensor, |state: &mut SensorState| {
        *state.shared.binding.lock() = Some(binding.clone());
    })?;

    let readings = {
        let sensor = sensor.clone();
        let sensor_ty = types.sensor.clone();
        tokio::task::spawn_blocking(move || -> module_fabric::Result<Vec<u16>> {
            sensor.method(&sensor_ty, |ctx| {
                let state = ctx.context::<SensorState>()?;
                if let Some(sampler) = &state.sampler {
                    for _ in 0..5 {
                        sampler.trigger();
                    }
                    sampler.flush();
                    tracing::info!("Sampler stats: {:?}", sampler.stats());
                }
                let readings = state.shared.readings.lock().clone();
                Ok(readings)
            })
        })
        .await??
    };
    println!("Sensor readings: {:?}", readings);

    sensor.invoke(&types.sensor, |state: &mut SensorState| {
        state.shared.binding.lock().take();
    })?;
    resolver.unbind(&binding)?;

    events.send(HostEvent::D0Exit).await?;
    events.send(HostEvent::ReleaseHardware).await?;
    drop(events);
    let delivered = pump_task.await??;
    tracing::info!("Delivered {} host events", delivered);

    tree.destroy_instance(&root)?;
    let events = drain(&mut lifecycle);
    tracing::info!(
        "Runtime stopped after {} lifecycle events, {} instances left",
        events.len(),
        tree.instance_count()
    );
    Ok(())
}

fn print_usage() {
    println!("ModuleFabric v{}", module_fabric::VERSION);
    println!();
    println!("Usage:");
    println!("  module_fabric                 run with ./{} or built-in defaults", DEFAULT_CONFIG);
    println!("  module_fabric <config>        run with a YAML or TOML configuration");
    println!("  module_fabric init [path]     write a default configuration file");
}

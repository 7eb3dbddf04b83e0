//! 宿主事件泵
//!
//! 从外部事件源（设备启动/停止/电源转换）接收宿主事件，转发给已登记的根实例。
//! 打开和关闭按约定是阻塞的，投递在阻塞线程池上执行。

use super::instance::ModuleHandle;
use super::tree::InstanceTree;
use crate::types::HostEvent;
use crate::{ModuleError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 宿主事件源
#[async_trait]
pub trait HostEventSource: Send {
    /// 下一个事件；事件源关闭时返回None
    async fn next_event(&mut self) -> Option<HostEvent>;
}

#[async_trait]
impl HostEventSource for mpsc::Receiver<HostEvent> {
    async fn next_event(&mut self) -> Option<HostEvent> {
        self.recv().await
    }
}

#[async_trait]
impl HostEventSource for mpsc::UnboundedReceiver<HostEvent> {
    async fn next_event(&mut self) -> Option<HostEvent> {
        self.recv().await
    }
}

/// 宿主事件泵
pub struct HostEventPump {
    tree: Arc<InstanceTree>,
    roots: Vec<ModuleHandle>,
}

impl HostEventPump {
    pub fn new(tree: Arc<InstanceTree>) -> Self {
        Self {
            tree,
            roots: Vec::new(),
        }
    }

    /// 登记接收事件的根实例
    pub fn with_root(mut self, root: ModuleHandle) -> Self {
        self.roots.push(root);
        self
    }

    pub fn add_root(&mut self, root: ModuleHandle) {
        self.roots.push(root);
    }

    pub fn roots(&self) -> &[ModuleHandle] {
        &self.roots
    }

    /// 同步投递一个事件到全部根实例
    pub fn deliver_all(&self, event: HostEvent) -> Result<()> {
        deliver_to_roots(&self.tree, &self.roots, event)
    }

    /// 持续消费事件直到事件源关闭，返回已投递的事件数量。
    /// 任一事件投递失败时停止并返回该错误。
    pub async fn run<S: HostEventSource>(&self, mut source: S) -> Result<usize> {
        let mut delivered = 0usize;

        while let Some(event) = source.next_event().await {
            let tree = self.tree.clone();
            let roots = self.roots.clone();
            tokio::task::spawn_blocking(move || deliver_to_roots(&tree, &roots, event))
                .await
                .map_err(|e| {
                    ModuleError::callback(format!("host event delivery task failed: {}", e))
                })??;
            delivered += 1;
        }

        info!("Host event source closed after {} events", delivered);
        Ok(delivered)
    }
}

/// 进入事件按登记顺序投递，退出事件按逆序投递。
/// 进入事件在某个根上失败时，已收到该事件的根按逆序收到配对的退出事件。
/// 退出事件投递到全部根之后返回第一个错误；已销毁的根被跳过。
fn deliver_to_roots(tree: &InstanceTree, roots: &[ModuleHandle], event: HostEvent) -> Result<()> {
    debug!(event = ?event, roots = roots.len(), "Pumping host event");

    if !event.is_entry() {
        let mut first_error = None;
        for root in roots.iter().rev() {
            if !root.is_alive() {
                debug!(root = %root.id(), event = ?event, "Exit delivery skipped for destroyed root");
                continue;
            }
            if let Err(e) = tree.deliver(root, event) {
                warn!(root = %root.id(), event = ?event, "Exit delivery failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        return first_error.map_or(Ok(()), Err);
    }

    for (index, root) in roots.iter().enumerate() {
        if let Err(e) = tree.deliver(root, event) {
            error!(root = %root.id(), event = ?event, "Entry delivery failed: {}", e);
            let exit = event.counterpart();
            for entered in roots[..index].iter().rev() {
                if let Err(unwind) = tree.deliver(entered, exit) {
                    warn!(root = %entered.id(), "Unwind delivery failed: {}", unwind);
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::descriptor::{DescriptorRegistry, OpenOption, TypeHandle};
    use crate::modules::lifecycle::LifecycleState;
    use crate::modules::ModuleDescriptor;

    fn powered(registry: &DescriptorRegistry, name: &str, fail: bool) -> TypeHandle {
        registry
            .register_type(
                ModuleDescriptor::builder(name)
                    .open_option(OpenOption::OnD0Entry)
                    .default_context::<u32>()
                    .on_open(move |_| {
                        if fail {
                            Err(ModuleError::callback("power rail fault"))
                        } else {
                            Ok(())
                        }
                    })
                    .build(),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_pump_delivers_until_source_closes() {
        let registry = DescriptorRegistry::new();
        let ty = powered(&registry, "Sensor", false);
        let tree = Arc::new(InstanceTree::default());
        let first = tree.create_instance(&ty, None, ()).unwrap();
        let second = tree.create_instance(&ty, None, ()).unwrap();

        let pump = HostEventPump::new(tree.clone())
            .with_root(first.clone())
            .with_root(second.clone());
        let (sender, receiver) = mpsc::channel(8);
        sender.send(HostEvent::PrepareHardware).await.unwrap();
        sender.send(HostEvent::D0Entry).await.unwrap();
        drop(sender);

        assert_eq!(pump.run(receiver).await.unwrap(), 2);
        assert_eq!(tree.state(&first).unwrap(), LifecycleState::Open);
        assert_eq!(tree.state(&second).unwrap(), LifecycleState::Open);

        pump.deliver_all(HostEvent::D0Exit).unwrap();
        assert_eq!(tree.state(&first).unwrap(), LifecycleState::Closed);
        assert_eq!(tree.state(&second).unwrap(), LifecycleState::Closed);
    }

    #[tokio::test]
    async fn test_failed_entry_stops_pump_and_unwinds() {
        let registry = DescriptorRegistry::new();
        let good = powered(&registry, "Sensor", false);
        let bad = powered(&registry, "Faulty", true);
        let tree = Arc::new(InstanceTree::default());
        let first = tree.create_instance(&good, None, ()).unwrap();
        let second = tree.create_instance(&bad, None, ()).unwrap();

        let pump = HostEventPump::new(tree.clone())
            .with_root(first.clone())
            .with_root(second.clone());
        let (sender, receiver) = mpsc::unbounded_channel();
        sender.send(HostEvent::D0Entry).unwrap();
        sender.send(HostEvent::D0Exit).unwrap();

        let result = pump.run(receiver).await;
        assert!(matches!(result, Err(ModuleError::OpenFailed { .. })));
        assert_eq!(tree.state(&first).unwrap(), LifecycleState::Closed);
        assert_eq!(tree.state(&second).unwrap(), LifecycleState::Closed);
    }

    #[test]
    fn test_exit_failure_reaches_every_root_then_reports() {
        let registry = DescriptorRegistry::new();
        let ty = powered(&registry, "Sensor", false);
        let faulty_exit = registry
            .register_type(
                ModuleDescriptor::builder("FaultyExit")
                    .open_option(OpenOption::OnD0Entry)
                    .on_notify(|_, event| {
                        if event.is_entry() {
                            Ok(())
                        } else {
                            Err(ModuleError::callback("power rail stuck high"))
                        }
                    })
                    .build(),
            )
            .unwrap();
        let tree = Arc::new(InstanceTree::default());
        let first = tree.create_instance(&ty, None, ()).unwrap();
        let second = tree.create_instance(&faulty_exit, None, ()).unwrap();

        let pump = HostEventPump::new(tree.clone())
            .with_root(first.clone())
            .with_root(second.clone());
        pump.deliver_all(HostEvent::D0Entry).unwrap();

        let result = pump.deliver_all(HostEvent::D0Exit);
        assert!(matches!(result, Err(ModuleError::Callback { .. })));
        assert_eq!(tree.state(&first).unwrap(), LifecycleState::Closed);
        assert_eq!(tree.state(&second).unwrap(), LifecycleState::Closed);
    }

    #[test]
    fn test_exit_ignores_stale_roots() {
        let registry = DescriptorRegistry::new();
        let ty = powered(&registry, "Sensor", false);
        let tree = Arc::new(InstanceTree::default());
        let root = tree.create_instance(&ty, None, ()).unwrap();
        tree.destroy_instance(&root).unwrap();

        let pump = HostEventPump::new(tree).with_root(root);
        assert!(pump.deliver_all(HostEvent::D0Exit).is_ok());
        assert!(pump.deliver_all(HostEvent::D0Entry).is_err());
    }
}

//! 合并调度器（"门铃"模式）
//!
//! 保证注册的回调对每次触发都至少完整执行一次，同时从不与自身并发执行，
//! 也不需要无界的待处理触发队列。每个调度器拥有一个专用工作线程。

use crate::config::DispatcherConfig;
use crate::{ModuleError, Result};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, warn};

/// 调度器回调
pub type DoorbellCallback = Box<dyn Fn() + Send + Sync + 'static>;

/// 调度器统计信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoorbellStats {
    /// 触发次数
    pub triggers: u64,
    /// 回调执行次数
    pub executions: u64,
    /// 以panic结束的执行次数
    pub panics: u64,
}

#[derive(Debug, Default)]
struct DoorbellState {
    pending: bool,
    running: bool,
    shutdown: bool,
}

struct Shared {
    name: String,
    state: Mutex<DoorbellState>,
    /// 唤醒工作线程
    wake: Condvar,
    /// 通知等待空闲的调用者
    idle: Condvar,
    callback: DoorbellCallback,
    triggers: AtomicU64,
    executions: AtomicU64,
    panics: AtomicU64,
}

/// 合并调度器
pub struct CoalescingDispatcher {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl CoalescingDispatcher {
    /// 创建调度器并启动专用工作线程
    pub fn new<F>(name: impl Into<String>, callback: F) -> Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let name = name.into();
        let shared = Arc::new(Shared {
            name: name.clone(),
            state: Mutex::new(DoorbellState::default()),
            wake: Condvar::new(),
            idle: Condvar::new(),
            callback: Box::new(callback),
            triggers: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            panics: AtomicU64::new(0),
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(worker_shared))
            .map_err(|e| {
                ModuleError::insufficient_resources(format!(
                    "Failed to spawn dispatcher worker '{}': {}",
                    name, e
                ))
            })?;
        let worker_id = worker.thread().id();

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    /// 按调度器配置创建，工作线程名为`<前缀>-<name>`
    pub fn from_config<F>(config: &DispatcherConfig, name: &str, callback: F) -> Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::new(format!("{}-{}", config.thread_name_prefix, name), callback)
    }

    /// 触发一次执行；立即返回
    pub fn trigger(&self) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            debug!("Dispatcher '{}' ignored trigger after shutdown", self.shared.name);
            return;
        }

        self.shared.triggers.fetch_add(1, Ordering::Relaxed);
        state.pending = true;
        if !state.running {
            state.running = true;
            self.shared.wake.notify_one();
        }
    }

    /// 阻塞直到没有执行在进行，也没有待处理的触发
    pub fn flush(&self) {
        if thread::current().id() == self.worker_id {
            warn!("Dispatcher '{}' flush called from its own callback", self.shared.name);
            return;
        }

        let mut state = self.shared.state.lock();
        while state.running {
            self.shared.idle.wait(&mut state);
        }
    }

    /// 停止调度器：丢弃待处理触发，等待进行中的执行完成。
    /// 返回后回调不会再被调用。
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.pending = false;
            self.shared.wake.notify_one();
        }

        if thread::current().id() == self.worker_id {
            // 在回调内部停止：当前执行结束后工作线程自行退出
            return;
        }

        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("Dispatcher '{}' worker panicked", self.shared.name);
            }
        }
        debug!("Dispatcher '{}' shut down", self.shared.name);
    }

    /// 是否正在执行或等待执行
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// 获取统计信息
    pub fn stats(&self) -> DoorbellStats {
        DoorbellStats {
            triggers: self.shared.triggers.load(Ordering::Relaxed),
            executions: self.shared.executions.load(Ordering::Relaxed),
            panics: self.shared.panics.load(Ordering::Relaxed),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl Drop for CoalescingDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CoalescingDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalescingDispatcher")
            .field("name", &self.shared.name)
            .field("stats", &self.stats())
            .finish()
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    loop {
        while !state.running && !state.shutdown {
            shared.wake.wait(&mut state);
        }
        if state.shutdown {
            break;
        }

        // running == true：执行直到没有新的触发
        loop {
            state.pending = false;
            drop(state);

            // 回调panic不能让工作线程退出，否则running永远不会复位
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (shared.callback)())) {
                shared.panics.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Dispatcher '{}' callback panicked: {}",
                    shared.name,
                    panic_message(&*payload)
                );
            }
            shared.executions.fetch_add(1, Ordering::Relaxed);

            state = shared.state.lock();
            if !state.pending || state.shutdown {
                break;
            }
        }

        state.running = false;
        shared.idle.notify_all();
    }

    state.running = false;
    shared.idle.notify_all();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_idle_trigger_runs_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let doorbell = CoalescingDispatcher::new("idle", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        doorbell.trigger();
        doorbell.flush();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(doorbell.stats().executions, 1);
    }

    #[test]
    fn test_triggers_during_execution_coalesce_into_one() {
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let entered_tx = Mutex::new(entered_tx);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        let doorbell = CoalescingDispatcher::new("coalesce", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                entered_tx.lock().send(()).unwrap();
                release_rx.lock().recv().unwrap();
            }
        })
        .unwrap();

        doorbell.trigger();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // 回调执行期间的N次触发只会导致一次额外执行
        for _ in 0..10 {
            doorbell.trigger();
        }
        release_tx.send(()).unwrap();
        doorbell.flush();

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(doorbell.stats().triggers, 11);
    }

    #[test]
    fn test_callback_never_runs_concurrently() {
        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));
        let (a, o) = (active.clone(), overlap.clone());

        let doorbell = Arc::new(
            CoalescingDispatcher::new("serial", move || {
                if a.fetch_add(1, Ordering::SeqCst) != 0 {
                    o.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_micros(200));
                a.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap(),
        );

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let doorbell = doorbell.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        doorbell.trigger();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        doorbell.flush();

        assert_eq!(overlap.load(Ordering::SeqCst), 0);
        let stats = doorbell.stats();
        assert!(stats.executions >= 1);
        assert!(stats.executions <= stats.triggers);
    }

    #[test]
    fn test_callback_may_trigger_itself() {
        let count = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Arc<CoalescingDispatcher>>>> = Arc::new(Mutex::new(None));
        let (counter, doorbell_slot) = (count.clone(), slot.clone());

        let doorbell = Arc::new(
            CoalescingDispatcher::new("reentrant", move || {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    if let Some(doorbell) = doorbell_slot.lock().clone() {
                        doorbell.trigger();
                    }
                }
            })
            .unwrap(),
        );
        *slot.lock() = Some(doorbell.clone());

        doorbell.trigger();
        doorbell.flush();
        assert_eq!(count.load(Ordering::SeqCst), 3);

        slot.lock().take();
    }

    #[test]
    fn test_panicking_callback_does_not_lose_triggers() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let doorbell = CoalescingDispatcher::new("panicky", move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("sensor read exploded");
            }
        })
        .unwrap();

        doorbell.trigger();
        doorbell.flush();
        assert!(!doorbell.is_running());

        doorbell.trigger();
        doorbell.flush();
        assert_eq!(count.load(Ordering::SeqCst), 2);

        let stats = doorbell.stats();
        assert_eq!(stats.executions, 2);
        assert_eq!(stats.panics, 1);
    }

    #[test]
    fn test_worker_thread_named_from_config() {
        let (name_tx, name_rx) = mpsc::channel::<Option<String>>();
        let name_tx = Mutex::new(name_tx);
        let config = DispatcherConfig {
            thread_name_prefix: "fabric".to_string(),
        };
        let doorbell = CoalescingDispatcher::from_config(&config, "sampler", move || {
            let name = thread::current().name().map(str::to_string);
            let _ = name_tx.lock().send(name);
        })
        .unwrap();

        assert_eq!(doorbell.name(), "fabric-sampler");
        doorbell.trigger();
        let name = name_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("fabric-sampler"));
    }

    #[test]
    fn test_no_invocation_after_shutdown() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let doorbell = CoalescingDispatcher::new("shutdown", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        doorbell.trigger();
        doorbell.shutdown();
        let after_shutdown = count.load(Ordering::SeqCst);

        doorbell.trigger();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), after_shutdown);
        assert!(!doorbell.is_running());
    }
}

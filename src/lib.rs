//! ModuleFabric - 组件组合与生命周期运行时
//!
//! 将独立编写的模块在运行时组装成实例树，每个模块拥有私有状态，
//! 参与由外部硬件/电源事件驱动的打开/关闭生命周期，
//! 并可通过后期绑定的接口契约（协议端/传输端）与协作者交互。
//!
//! # 架构分层
//!
//! - **模块层**: 描述符注册表、实例树管理器、生命周期状态机、绑定解析器
//! - **核心基础层**: 合并调度器（门铃）、生命周期事件总线
//! - **配置与错误**: YAML/TOML配置、统一错误类型

pub mod config;
pub mod core;
pub mod error;
pub mod modules;
pub mod types;

// 重新导出核心类型
pub use crate::core::*;
pub use config::{ConfigManager, LoggingConfig, RuntimeConfig};
pub use error::{ModuleError, Result};
pub use modules::*;
pub use types::*;

/// 框架信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const FRAMEWORK_NAME: &str = "ModuleFabric";

/// 初始化日志系统。重复调用不会覆盖已安装的订阅者。
pub fn initialize(logging: &LoggingConfig) {
    let level: tracing::Level = logging.level.into();
    if tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok()
    {
        tracing::info!("Initializing {} v{} (log level {})", FRAMEWORK_NAME, VERSION, level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framework_info() {
        assert_eq!(FRAMEWORK_NAME, "ModuleFabric");
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let logging = LoggingConfig::default();
        initialize(&logging);
        initialize(&logging);
    }
}

//! ModuleFabric 配置管理系统
//!
//! 支持YAML/TOML配置文件驱动的运行时设置，包括传输选择器

use crate::{ModuleError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// 运行时配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// 运行时基础设置
    pub runtime: RuntimeSettings,
    /// 合并调度器配置
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// 协议名称 -> 传输选择器
    #[serde(default)]
    pub selectors: BTreeMap<String, u32>,
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 运行时基础设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// 运行时名称
    pub name: String,
    /// 最大实例数量
    pub max_instances: usize,
    /// 生命周期事件通道容量
    pub event_capacity: usize,
}

/// 合并调度器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// 工作线程名前缀
    pub thread_name_prefix: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "doorbell".to_string(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeSettings {
                name: "ModuleFabric".to_string(),
                max_instances: 4096,
                event_capacity: 1024,
            },
            dispatcher: DispatcherConfig::default(),
            selectors: BTreeMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

/// 配置文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            Some("toml") => Ok(Self::Toml),
            other => Err(ModuleError::config(format!(
                "Unsupported config file extension: {:?}",
                other
            ))),
        }
    }
}

/// 配置管理器
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: RuntimeConfig,
}

impl ConfigManager {
    /// 从文件加载配置
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ModuleError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config = Self::parse(&content, format)?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(Self { config })
    }

    fn parse(content: &str, format: ConfigFormat) -> Result<RuntimeConfig> {
        let config = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(content)?,
            ConfigFormat::Toml => toml::from_str(content)?,
        };
        Ok(config)
    }

    /// 创建默认配置
    pub fn new_default() -> Self {
        Self {
            config: RuntimeConfig::default(),
        }
    }

    /// 使用给定配置
    pub fn from_config(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// 保存配置到文件
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match ConfigFormat::from_path(path)? {
            ConfigFormat::Yaml => serde_yaml::to_string(&self.config)?,
            ConfigFormat::Toml => toml::to_string_pretty(&self.config)
                .map_err(|e| ModuleError::config(format!("Failed to serialize config: {}", e)))?,
        };

        tokio::fs::write(path, content).await.map_err(|e| {
            ModuleError::config(format!("Failed to write config file {}: {}", path.display(), e))
        })?;

        Ok(())
    }

    /// 获取配置
    pub fn get_config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// 获取可变配置
    pub fn get_config_mut(&mut self) -> &mut RuntimeConfig {
        &mut self.config
    }

    /// 查询协议的传输选择器；未配置时报告配置错误而不是猜测默认值
    pub fn selector(&self, protocol: &str) -> Result<u32> {
        self.config.selectors.get(protocol).copied().ok_or_else(|| {
            ModuleError::config(format!("No transport selector configured for '{}'", protocol))
        })
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        let runtime = &self.config.runtime;
        if runtime.name.is_empty() {
            return Err(ModuleError::config("Runtime name cannot be empty"));
        }

        if runtime.max_instances == 0 {
            return Err(ModuleError::config("max_instances must be positive"));
        }

        if runtime.event_capacity == 0 {
            return Err(ModuleError::config("event_capacity must be positive"));
        }

        if self.config.dispatcher.thread_name_prefix.is_empty() {
            return Err(ModuleError::config("Dispatcher thread name prefix cannot be empty"));
        }

        tracing::info!("Configuration validation passed");
        Ok(())
    }
}

/// 生成默认配置文件
pub async fn generate_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let mut config = RuntimeConfig::default();
    config.selectors.insert("SensorProtocol".to_string(), 0);
    ConfigManager::from_config(config).save_to_file(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::fs;

    #[tokio::test]
    async fn test_config_manager_default() {
        let config_manager = ConfigManager::new_default();
        let config = config_manager.get_config();

        assert_eq!(config.runtime.name, "ModuleFabric");
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(config_manager.validate().is_ok());
    }

    #[tokio::test]
    async fn test_config_save_and_load_yaml() {
        let temp_path = std::env::temp_dir().join(format!("mf_{}.yaml", uuid::Uuid::new_v4()));

        let mut config = RuntimeConfig::default();
        config.selectors.insert("SensorProtocol".to_string(), 1);
        ConfigManager::from_config(config).save_to_file(&temp_path).await.unwrap();

        let loaded = ConfigManager::load_from_file(&temp_path).await.unwrap();
        assert_eq!(loaded.selector("SensorProtocol").unwrap(), 1);

        let _ = fs::remove_file(&temp_path).await;
    }

    #[tokio::test]
    async fn test_config_save_and_load_toml() {
        let temp_path = std::env::temp_dir().join(format!("mf_{}.toml", uuid::Uuid::new_v4()));

        generate_default_config_file(&temp_path).await.unwrap();
        let loaded = ConfigManager::load_from_file(&temp_path).await.unwrap();
        assert_eq!(loaded.get_config().runtime.max_instances, 4096);
        assert_eq!(loaded.selector("SensorProtocol").unwrap(), 0);

        let _ = fs::remove_file(&temp_path).await;
    }

    #[tokio::test]
    async fn test_unknown_extension_is_rejected() {
        let result = ConfigManager::load_from_file("settings.ini").await;
        assert!(matches!(result, Err(ModuleError::Configuration { .. })));
    }

    #[test]
    fn test_missing_selector_is_reported() {
        let manager = ConfigManager::new_default();
        assert!(matches!(
            manager.selector("Unknown"),
            Err(ModuleError::Configuration { .. })
        ));
    }

    #[test]
    fn test_validation_failures() {
        let mut manager = ConfigManager::new_default();
        manager.get_config_mut().runtime.max_instances = 0;
        assert!(manager.validate().is_err());

        let mut manager = ConfigManager::new_default();
        manager.get_config_mut().dispatcher.thread_name_prefix.clear();
        assert!(manager.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "runtime:\n  name: edge\n  max_instances: 8\n  event_capacity: 16\n";
        let config = ConfigManager::parse(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.runtime.name, "edge");
        assert_eq!(config.dispatcher, DispatcherConfig::default());
        assert!(config.selectors.is_empty());
    }
}

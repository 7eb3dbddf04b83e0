//! ModuleFabric 错误处理系统
//!
//! 统一的错误类型和错误处理机制

use thiserror::Error;

/// 框架统一错误类型
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid descriptor '{type_name}': {message}")]
    InvalidDescriptor { type_name: String, message: String },

    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    #[error("Insufficient resources: {message}")]
    InsufficientResources { message: String },

    #[error("Child module '{type_name}' failed to construct: {source}")]
    ChildConstructionFailed {
        type_name: String,
        #[source]
        source: Box<ModuleError>,
    },

    #[error("Module '{type_name}' failed to open: {source}")]
    OpenFailed {
        type_name: String,
        #[source]
        source: Box<ModuleError>,
    },

    #[error("Module '{type_name}' is not open (state: {state})")]
    NotOpen { type_name: String, state: String },

    #[error("Interface mismatch for '{interface}': {message}")]
    InterfaceMismatch { interface: String, message: String },

    #[error("Instance {instance} is already bound for interface '{interface}'")]
    AlreadyBound { instance: String, interface: String },

    #[error("Binding for interface '{interface}' is not bound")]
    NotBound { interface: String },

    #[error("Binding for interface '{interface}' rolled back: {source}")]
    BindRolledBack {
        interface: String,
        #[source]
        source: Box<ModuleError>,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Callback error: {message}")]
    Callback { message: String },
}

impl ModuleError {
    /// 创建参数错误
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// 创建描述符错误
    pub fn invalid_descriptor(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// 创建资源不足错误
    pub fn insufficient_resources(message: impl Into<String>) -> Self {
        Self::InsufficientResources {
            message: message.into(),
        }
    }

    /// 创建配置相关错误
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// 创建回调错误（叶子模块代码使用）
    pub fn callback(message: impl Into<String>) -> Self {
        Self::Callback {
            message: message.into(),
        }
    }
}

/// 编程误用：调试构建下立即断言失败，发布构建下记录并返回错误
#[track_caller]
pub(crate) fn misuse(error: ModuleError) -> ModuleError {
    tracing::error!("Programmer misuse: {}", error);
    debug_assert!(false, "programmer misuse: {error}");
    error
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, ModuleError>;

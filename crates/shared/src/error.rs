//! 统一错误处理模块
//!
//! 定义基础设施层共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 这里只描述"哪里出了错"，是否值得重试由消费端的处理器统一判定。

use thiserror::Error;

/// 基础设施错误类型
///
/// 派生 Clone 以便测试桩可以反复注入同一个故障。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    // ==================== Kafka 错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    #[error("序列化失败: {0}")]
    Serialization(String),

    // ==================== 外部服务错误 ====================
    /// 外部服务明确拒绝了请求（4xx、无法理解的响应）
    #[error("外部服务错误: {service} - {message}")]
    ExternalService { service: String, message: String },

    /// 连接失败或服务端 5xx
    #[error("外部服务不可用: {service} - {message}")]
    ExternalServiceUnavailable { service: String, message: String },

    #[error("外部服务超时: {service}")]
    ExternalServiceTimeout { service: String },

    // ==================== 通用错误 ====================
    #[error("配置错误: {0}")]
    Config(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl RelayError {
    /// 获取错误码，写入日志与死信信封
    pub fn code(&self) -> &'static str {
        match self {
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::ExternalServiceUnavailable { .. } => "EXTERNAL_SERVICE_UNAVAILABLE",
            Self::ExternalServiceTimeout { .. } => "EXTERNAL_SERVICE_TIMEOUT",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

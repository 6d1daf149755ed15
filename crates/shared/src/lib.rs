//! 共享库
//!
//! 包含调度中继服务共用的配置、错误处理、事件模型、Kafka 封装、
//! 死信队列、重试策略与可观测性等基础设施代码。

pub mod config;
pub mod dlq;
pub mod error;
pub mod events;
pub mod kafka;
pub mod observability;
pub mod publisher;
pub mod retry;
pub mod test_utils;

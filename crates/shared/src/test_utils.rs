//! 测试工具模块
//!
//! 提供集成测试所需的辅助函数、内存实现和测试数据生成器。
//! 用于在没有 Kafka 的环境中验证发布顺序与死信行为。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::dlq::{DeadLetterMessage, DeadLetterSink};
use crate::error::RelayError;
use crate::events::{DispatchEvent, OrderCreated};
use crate::kafka::{ConsumerMessage, DeliveryAck, topics};
use crate::publisher::EventPublisher;

// ==================== 测试数据生成器 ====================

/// 测试事件数据
pub struct TestEventData;

impl TestEventData {
    pub fn order_created(order_id: Uuid, item: &str) -> OrderCreated {
        OrderCreated::new(order_id, item)
    }

    /// 随机订单 ID 与随机商品名
    pub fn random_order_created() -> OrderCreated {
        OrderCreated::new(Uuid::new_v4(), format!("item-{}", Uuid::new_v4()))
    }

    /// 以 JSON 负载包装成一条 order.created 消息
    pub fn consumer_message(key: Option<&str>, event: &OrderCreated) -> ConsumerMessage {
        let payload = serde_json::to_vec(event).expect("序列化测试事件失败");
        Self::raw_message(key, payload)
    }

    pub fn raw_message(key: Option<&str>, payload: Vec<u8>) -> ConsumerMessage {
        ConsumerMessage {
            topic: topics::ORDER_CREATED.to_string(),
            partition: 0,
            offset: 42,
            key: key.map(String::from),
            payload,
        }
    }
}

// ==================== 内存发布器 ====================

/// 一次发布调用的记录（无论成功与否）
#[derive(Debug, Clone, PartialEq)]
pub struct PublishAttempt {
    pub topic: String,
    pub key: String,
    pub event: DispatchEvent,
    pub succeeded: bool,
}

/// 记录所有发布调用的内存发布器
///
/// 可按事件类型预设故障，用于验证"失败后不再尝试后续发布"。
#[derive(Debug, Default, Clone)]
pub struct RecordingPublisher {
    attempts: Arc<RwLock<Vec<PublishAttempt>>>,
    failures: Arc<RwLock<HashMap<String, RelayError>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让指定事件类型（如 "OrderDispatched"）的发布返回给定错误
    pub async fn fail_on(&self, event_type: &str, error: RelayError) {
        self.failures
            .write()
            .await
            .insert(event_type.to_string(), error);
    }

    /// 所有发布调用，按调用顺序
    pub async fn attempts(&self) -> Vec<PublishAttempt> {
        self.attempts.read().await.clone()
    }

    /// 已被确认的发布，按调用顺序
    pub async fn published(&self) -> Vec<PublishAttempt> {
        self.attempts
            .read()
            .await
            .iter()
            .filter(|a| a.succeeded)
            .cloned()
            .collect()
    }

    /// 已确认发布的事件类型序列
    pub async fn published_types(&self) -> Vec<&'static str> {
        self.published()
            .await
            .iter()
            .map(|a| a.event.event_type())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        event: &DispatchEvent,
    ) -> Result<DeliveryAck, RelayError> {
        let failure = self.failures.read().await.get(event.event_type()).cloned();

        let mut attempts = self.attempts.write().await;
        attempts.push(PublishAttempt {
            topic: topic.to_string(),
            key: key.to_string(),
            event: event.clone(),
            succeeded: failure.is_none(),
        });

        match failure {
            Some(err) => Err(err),
            None => Ok(DeliveryAck {
                topic: topic.to_string(),
                partition: 0,
                offset: attempts.len() as i64 - 1,
            }),
        }
    }
}

// ==================== 内存死信 ====================

/// 记录死信写入的内存实现
#[derive(Debug, Default, Clone)]
pub struct RecordingDeadLetterSink {
    messages: Arc<RwLock<Vec<DeadLetterMessage>>>,
    failure: Arc<RwLock<Option<RelayError>>>,
}

impl RecordingDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟死信 topic 不可写
    pub async fn fail_with(&self, error: RelayError) {
        *self.failure.write().await = Some(error);
    }

    pub async fn messages(&self) -> Vec<DeadLetterMessage> {
        self.messages.read().await.clone()
    }
}

#[async_trait]
impl DeadLetterSink for RecordingDeadLetterSink {
    async fn dead_letter(&self, message: &DeadLetterMessage) -> Result<(), RelayError> {
        if let Some(err) = self.failure.read().await.clone() {
            return Err(err);
        }
        self.messages.write().await.push(message.clone());
        Ok(())
    }
}

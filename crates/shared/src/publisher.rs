//! 出站事件发布抽象
//!
//! 调度流程只依赖 `EventPublisher`，生产环境由 Kafka 生产者实现，
//! 测试中替换为内存记录器。

use async_trait::async_trait;

use crate::error::RelayError;
use crate::events::DispatchEvent;
use crate::kafka::{DeliveryAck, EVENT_TYPE_HEADER, KafkaProducer};

/// 事件发布接口
///
/// `publish` 在 broker 确认写入（或失败）之后才返回；相同 key 落到同一分区，
/// 因而同一订单的多次发布保持顺序。实现必须可被并发调用。
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        event: &DispatchEvent,
    ) -> Result<DeliveryAck, RelayError>;
}

#[async_trait]
impl EventPublisher for KafkaProducer {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        event: &DispatchEvent,
    ) -> Result<DeliveryAck, RelayError> {
        self.send_json(topic, key, event, &[(EVENT_TYPE_HEADER, event.event_type())])
            .await
    }
}

//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Producer/Consumer 抽象，
//! 统一消息序列化、错误映射、手动位点提交和优雅关闭语义。

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::RelayError;
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Topic 常量
// ---------------------------------------------------------------------------

/// 集中管理所有 Kafka topic 名称，这些名称是与上下游服务约定的固定契约
pub mod topics {
    pub const ORDER_CREATED: &str = "order.created";
    pub const DISPATCH_TRACKING: &str = "dispatch.tracking";
    pub const ORDER_DISPATCHED: &str = "order.dispatched";
    pub const ORDER_CREATED_DLT: &str = "order.created.DLT";
}

/// 消息头：出站事件类型
pub const EVENT_TYPE_HEADER: &str = "eventType";

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|raw| decode_key(raw, msg.topic(), msg.partition(), msg.offset()));

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
        }
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, RelayError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| RelayError::Serialization(format!("负载反序列化失败: {e}")))
    }
}

/// 非 UTF-8 的 key 按无 key 处理，下游会改用 orderId 作为路由键
fn decode_key(raw: &[u8], topic: &str, partition: i32, offset: i64) -> Option<String> {
    match std::str::from_utf8(raw) {
        Ok(key) => Some(key.to_string()),
        Err(e) => {
            warn!(
                topic,
                partition,
                offset,
                error = %e,
                "消息 key 非 UTF-8 编码，按无 key 处理，分区可能与上游不一致"
            );
            None
        }
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// broker 对一次发送的确认
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAck {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// 面向业务的 Kafka 生产者
///
/// 封装 `FutureProducer` 并提供类型安全的 JSON 发送方法，
/// 内部已派生 Clone（`FutureProducer` 本身是 Arc 包装的）。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// `message.timeout.ms` 决定每次发送等待确认的上限，调度服务自身不再叠加超时。
    /// 开启幂等生产保证同一分区内的重试不会乱序。
    pub fn new(config: &KafkaConfig) -> Result<Self, RelayError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .create()
            .map_err(|e| RelayError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self {
            producer,
            send_timeout: Duration::from_millis(config.message_timeout_ms),
        })
    }

    /// 发送原始字节消息并等待 broker 确认
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        headers: &[(&str, &str)],
    ) -> Result<DeliveryAck, RelayError> {
        let owned_headers = headers
            .iter()
            .fold(OwnedHeaders::new(), |acc, (name, value)| {
                acc.insert(Header {
                    key: *name,
                    value: Some(*value),
                })
            });

        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .headers(owned_headers);

        // rdkafka 0.39+ 返回 Delivery 结构体而非元组
        let delivery = self
            .producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| RelayError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok(DeliveryAck {
            topic: topic.to_string(),
            partition: delivery.partition,
            offset: delivery.offset,
        })
    }

    /// 将值序列化为 JSON 后发送
    ///
    /// 序列化与网络发送拆分为两步，便于独立定位故障原因。
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
        headers: &[(&str, &str)],
    ) -> Result<DeliveryAck, RelayError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| RelayError::Serialization(format!("序列化失败: {e}")))?;

        self.send(topic, key, &payload, headers).await
    }
}


// ---------------------------------------------------------------------------
// 位点处置
// ---------------------------------------------------------------------------

/// 一条消息处理结束后对位点的处置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    /// 消息已到终态，提交"下一条待消费"的位点
    Commit(Offset),
    /// 消息未到终态，退避后回退到该消息重新消费
    Rewind { offset: Offset, delay: Duration },
}

impl Settlement {
    /// `consecutive_failures` 为同一位点连续未能处置的次数（含本次）
    fn decide(handled: bool, offset: i64, consecutive_failures: u32, backoff: &RetryPolicy) -> Self {
        if handled {
            Self::Commit(Offset::Offset(offset + 1))
        } else {
            Self::Rewind {
                offset: Offset::Offset(offset),
                delay: backoff.delay_for_attempt(consecutive_failures.saturating_sub(1)),
            }
        }
    }
}

/// 记录每个分区当前位点连续回退的次数
#[derive(Debug, Default)]
struct RedeliveryTracker {
    failures: HashMap<(String, i32), (i64, u32)>,
}

impl RedeliveryTracker {
    fn record_failure(&mut self, topic: &str, partition: i32, offset: i64) -> u32 {
        let entry = self
            .failures
            .entry((topic.to_string(), partition))
            .or_insert((offset, 0));
        if entry.0 != offset {
            *entry = (offset, 0);
        }
        entry.1 += 1;
        entry.1
    }

    fn clear(&mut self, topic: &str, partition: i32) {
        self.failures.remove(&(topic.to_string(), partition));
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 消费者
///
/// 关闭自动提交，由 handler 的返回值决定位点去向：
/// - `Ok(())`：消息已到达终态，提交位点
/// - `Err(_)`：消息未能妥善处置，按退避策略等待后回退到该消息位点
pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    pub fn new(config: &KafkaConfig) -> Result<Self, RelayError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| RelayError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(
            brokers = %config.brokers,
            group_id = %config.consumer_group,
            "Kafka 消费者已初始化"
        );
        Ok(Self { consumer })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), RelayError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| RelayError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 启动消费循环
    ///
    /// 使用 `tokio::select!` 同时监听消息流和关闭信号。每条消息在 handler
    /// 返回之后才拉取下一条，保证同一分区内严格有序。同一位点连续失败时
    /// 按 `backoff` 逐次拉长回退前的等待，间隔以 `max_delay` 为上限。
    pub async fn start<F, Fut>(
        self,
        mut shutdown: watch::Receiver<bool>,
        backoff: &RetryPolicy,
        handler: F,
    ) where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = Result<(), RelayError>>,
    {
        use futures::StreamExt;

        let stream = self.consumer.stream();
        futures::pin_mut!(stream);
        let mut redeliveries = RedeliveryTracker::default();

        info!("Kafka 消费循环已启动");

        loop {
            tokio::select! {
                // 偏向关闭信号，保证收到关闭时能尽快退出
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        break;
                    }
                }

                msg_result = stream.next() => {
                    let Some(msg_result) = msg_result else {
                        warn!("Kafka 消息流意外结束");
                        break;
                    };

                    let msg = match msg_result {
                        Ok(borrowed_msg) => ConsumerMessage::from_borrowed(&borrowed_msg),
                        Err(e) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                            continue;
                        }
                    };

                    debug!(
                        topic = %msg.topic,
                        partition = msg.partition,
                        offset = msg.offset,
                        "收到 Kafka 消息"
                    );

                    let (topic, partition, offset) = (msg.topic.clone(), msg.partition, msg.offset);
                    let settlement = match handler(msg).await {
                        Ok(()) => {
                            redeliveries.clear(&topic, partition);
                            Settlement::decide(true, offset, 0, backoff)
                        }
                        Err(e) => {
                            let failures = redeliveries.record_failure(&topic, partition, offset);
                            let settlement = Settlement::decide(false, offset, failures, backoff);
                            if failures > backoff.max_retries {
                                error!(
                                    error = %e,
                                    topic = %topic,
                                    partition,
                                    offset,
                                    failures,
                                    "消息持续无法处置，按最大间隔回退重试"
                                );
                            } else {
                                warn!(
                                    error = %e,
                                    topic = %topic,
                                    partition,
                                    offset,
                                    failures,
                                    "消息未能处置，退避后回退位点"
                                );
                            }
                            settlement
                        }
                    };

                    let settled = match settlement {
                        Settlement::Commit(next) => self.commit(&topic, partition, next),
                        Settlement::Rewind { offset: target, delay } => {
                            // 等待期间仍响应关闭信号；未提交的位点会在重启后重新投递
                            tokio::select! {
                                biased;
                                _ = shutdown.changed() => {
                                    info!("退避等待中收到关闭信号，Kafka 消费循环退出");
                                    break;
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                            self.rewind(&topic, partition, target)
                        }
                    };

                    if let Err(e) = settled {
                        error!(error = %e, topic = %topic, partition, offset, "更新消费位点失败");
                    }
                }
            }
        }
    }

    fn commit(&self, topic: &str, partition: i32, next: Offset) -> Result<(), RelayError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, next)
            .map_err(|e| RelayError::Kafka(format!("构造提交位点失败: {e}")))?;

        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| RelayError::Kafka(format!("提交位点失败: {e}")))
    }

    fn rewind(&self, topic: &str, partition: i32, target: Offset) -> Result<(), RelayError> {
        self.consumer
            .seek(topic, partition, target, SEEK_TIMEOUT)
            .map_err(|e| RelayError::Kafka(format!("回退位点失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn message(payload: &[u8]) -> ConsumerMessage {
        ConsumerMessage {
            topic: topics::ORDER_CREATED.to_string(),
            partition: 0,
            offset: 0,
            key: None,
            payload: payload.to_vec(),
        }
    }

    fn backoff() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_topic_constants() {
        assert_eq!(topics::ORDER_CREATED, "order.created");
        assert_eq!(topics::DISPATCH_TRACKING, "dispatch.tracking");
        assert_eq!(topics::ORDER_DISPATCHED, "order.dispatched");
        assert_eq!(topics::ORDER_CREATED_DLT, "order.created.DLT");
    }

    #[test]
    fn test_consumer_message_deserialize() {
        let msg = message(br#"{"orderId":"6a1e0b7e-8f3c-4a39-9d5e-2f4f1d1c7b10","item":"Book"}"#);

        let event: crate::events::OrderCreated = msg.deserialize_payload().unwrap();
        assert_eq!(event.item, "Book");
    }

    #[test]
    fn test_consumer_message_deserialize_invalid_json() {
        let msg = message(b"not json");

        let result: Result<serde_json::Value, _> = msg.deserialize_payload();
        assert!(matches!(result, Err(RelayError::Serialization(_))));
    }

    #[test]
    fn test_decode_key() {
        assert_eq!(
            decode_key(b"order-1", "order.created", 0, 7),
            Some("order-1".to_string())
        );
        assert_eq!(decode_key(&[0xFF, 0xFE], "order.created", 0, 7), None);
    }

    // ==================== 位点处置测试 ====================

    #[test]
    fn test_handled_message_commits_next_offset() {
        assert_eq!(
            Settlement::decide(true, 41, 0, &backoff()),
            Settlement::Commit(Offset::Offset(42))
        );
        assert_eq!(
            Settlement::decide(true, 0, 0, &backoff()),
            Settlement::Commit(Offset::Offset(1))
        );
    }

    #[test]
    fn test_unhandled_message_rewinds_to_same_offset() {
        assert_eq!(
            Settlement::decide(false, 41, 1, &backoff()),
            Settlement::Rewind {
                offset: Offset::Offset(41),
                delay: Duration::from_millis(100),
            }
        );
    }

    #[test]
    fn test_repeated_failures_back_off_up_to_max_delay() {
        let policy = backoff();
        let mut tracker = RedeliveryTracker::default();

        let delays: Vec<Duration> = (0..6)
            .map(|_| {
                let failures = tracker.record_failure("order.created", 0, 41);
                match Settlement::decide(false, 41, failures, &policy) {
                    Settlement::Rewind { delay, .. } => delay,
                    other => panic!("unexpected settlement: {other:?}"),
                }
            })
            .collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1000),
                Duration::from_millis(1000),
            ]
        );
    }

    #[test]
    fn test_tracker_resets_on_new_offset_and_after_success() {
        let mut tracker = RedeliveryTracker::default();

        assert_eq!(tracker.record_failure("order.created", 0, 41), 1);
        assert_eq!(tracker.record_failure("order.created", 0, 41), 2);
        // 其他分区独立计数
        assert_eq!(tracker.record_failure("order.created", 1, 41), 1);
        // 同一分区推进到新位点后重新计数
        assert_eq!(tracker.record_failure("order.created", 0, 42), 1);

        tracker.clear("order.created", 0);
        assert_eq!(tracker.record_failure("order.created", 0, 42), 1);
    }
}

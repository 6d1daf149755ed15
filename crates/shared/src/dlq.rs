//! 死信队列处理
//!
//! 不可重试的毒消息、以及重试耗尽的消息，都会被包装成死信信封写入
//! `order.created.DLT`，随后提交原消息位点让消费者继续前进。
//! 死信是终态：这里不做自动回放，由运维排查后人工处置。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RelayError;
use crate::kafka::{ConsumerMessage, KafkaProducer, topics};

/// 消息头：进入死信的原因
pub const DEAD_LETTER_REASON_HEADER: &str = "dltReason";

// ---------------------------------------------------------------------------
// DeadLetterMessage：死信消息信封
// ---------------------------------------------------------------------------

/// 进入死信队列的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterReason {
    /// 处理器判定为不可重试
    NotRetryable,
    /// 可重试错误，但重试次数已耗尽
    RetriesExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRetryable => "NOT_RETRYABLE",
            Self::RetriesExhausted => "RETRIES_EXHAUSTED",
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 死信消息信封
///
/// 保留原始消息的位置和负载，附加失败原因与尝试次数，便于排查和人工重放。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始消息 key（路由键）
    pub message_id: String,
    pub source_topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
    /// 原始负载；非 UTF-8 负载以有损方式转换
    pub payload: String,
    pub reason: DeadLetterReason,
    pub error: String,
    pub error_code: String,
    /// 处理器被调用的次数，负载无法解析时为 0
    pub attempts: u32,
    pub received_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    pub source_service: String,
}

impl DeadLetterMessage {
    #[allow(clippy::too_many_arguments)]
    pub fn from_message(
        msg: &ConsumerMessage,
        message_id: impl Into<String>,
        reason: DeadLetterReason,
        error: impl Into<String>,
        error_code: impl Into<String>,
        attempts: u32,
        received_at: DateTime<Utc>,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            source_topic: msg.topic.clone(),
            source_partition: msg.partition,
            source_offset: msg.offset,
            payload: String::from_utf8_lossy(&msg.payload).into_owned(),
            reason,
            error: error.into(),
            error_code: error_code.into(),
            attempts,
            received_at,
            failed_at: Utc::now(),
            source_service: source_service.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// DeadLetterSink：死信写入抽象
// ---------------------------------------------------------------------------

/// 死信写入接口
///
/// 写入失败时返回错误，调用方据此决定不提交原消息位点。
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, message: &DeadLetterMessage) -> Result<(), RelayError>;
}

/// DLQ 生产者
pub struct DlqProducer {
    producer: KafkaProducer,
}

impl DlqProducer {
    pub fn new(producer: KafkaProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl DeadLetterSink for DlqProducer {
    /// 以原消息 key 写入死信 topic，保持与原分区一致的顺序语义
    async fn dead_letter(&self, message: &DeadLetterMessage) -> Result<(), RelayError> {
        self.producer
            .send_json(
                topics::ORDER_CREATED_DLT,
                &message.message_id,
                message,
                &[(DEAD_LETTER_REASON_HEADER, message.reason.as_str())],
            )
            .await?;

        warn!(
            message_id = %message.message_id,
            source_topic = %message.source_topic,
            partition = message.source_partition,
            offset = message.source_offset,
            reason = %message.reason,
            attempts = message.attempts,
            error = %message.error,
            "消息已发送到死信队列"
        );

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

//! order.created 消费与重试层
//!
//! 每条消息的状态流转：
//! RECEIVED → PROCESSING → COMMITTED
//!                       → RETRY_SCHEDULED → PROCESSING
//!                       → DEAD_LETTERED
//!
//! 只有 COMMITTED 与 DEAD_LETTERED 两个终态会提交位点；
//! 死信写入失败时不提交，消费者按重试策略退避后回退位点等待重新投递。

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use dispatch_shared::config::AppConfig;
use dispatch_shared::dlq::{DeadLetterMessage, DeadLetterReason, DeadLetterSink};
use dispatch_shared::error::RelayError;
use dispatch_shared::events::OrderCreated;
use dispatch_shared::kafka::{ConsumerMessage, KafkaConsumer, topics};
use dispatch_shared::observability::metrics;
use dispatch_shared::retry::{RetryPolicy, retry_with_policy};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::{DispatchError, HandlerError};
use crate::handler::OrderCreatedHandler;

/// 一条消息的终态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 处理成功（或按策略确认），`attempts` 为处理器被调用的次数
    Committed { attempts: u32 },
    DeadLettered {
        attempts: u32,
        reason: DeadLetterReason,
    },
}

/// 消费重试层运行所需的协作者
pub struct DeliveryContext<'a> {
    pub handler: &'a OrderCreatedHandler,
    pub dead_letters: &'a dyn DeadLetterSink,
    pub retry_policy: &'a RetryPolicy,
    pub source_service: &'a str,
}

/// 把一条原始消息推进到终态
///
/// 返回 `Err` 表示死信写入失败，消息未到终态，调用方不得提交位点。
pub async fn deliver(
    ctx: &DeliveryContext<'_>,
    msg: &ConsumerMessage,
) -> Result<DeliveryOutcome, RelayError> {
    let received_at = Utc::now();
    debug!(
        partition = msg.partition,
        offset = msg.offset,
        "RECEIVED order.created 消息"
    );

    let event: OrderCreated = match msg.deserialize_payload() {
        Ok(event) => event,
        Err(e) => {
            let message_id = match msg.key.as_deref() {
                Some(k) if !k.is_empty() => k.to_string(),
                _ => format!("{}-{}-{}", msg.topic, msg.partition, msg.offset),
            };
            let cause = DispatchError::MalformedPayload(e.to_string());
            return dead_letter(
                ctx,
                msg,
                &message_id,
                DeadLetterReason::NotRetryable,
                &cause,
                0,
                received_at,
            )
            .await;
        }
    };

    // 没有 key 的消息用 orderId 作为路由键，保证三次发布落在同一分区
    let key = match msg.key.as_deref() {
        Some(k) if !k.is_empty() => k.to_string(),
        _ => event.order_id.to_string(),
    };

    let attempts = AtomicU32::new(0);
    let result = retry_with_policy(
        ctx.retry_policy,
        "order_created.listen",
        HandlerError::is_retryable,
        || {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(key = %key, attempt, "PROCESSING order.created 消息");
            ctx.handler.listen(msg.partition, &key, &event)
        },
    )
    .await;
    let attempts = attempts.into_inner();
    metrics::record_retries(attempts.saturating_sub(1));

    match result {
        Ok(()) => {
            metrics::record_message_outcome("committed");
            info!(
                key = %key,
                partition = msg.partition,
                offset = msg.offset,
                attempts,
                "COMMITTED order.created 消息"
            );
            Ok(DeliveryOutcome::Committed { attempts })
        }
        Err(err) => {
            let reason = if err.is_retryable() {
                DeadLetterReason::RetriesExhausted
            } else {
                DeadLetterReason::NotRetryable
            };
            dead_letter(ctx, msg, &key, reason, err.cause(), attempts, received_at).await
        }
    }
}

async fn dead_letter(
    ctx: &DeliveryContext<'_>,
    msg: &ConsumerMessage,
    message_id: &str,
    reason: DeadLetterReason,
    cause: &DispatchError,
    attempts: u32,
    received_at: chrono::DateTime<Utc>,
) -> Result<DeliveryOutcome, RelayError> {
    let envelope = DeadLetterMessage::from_message(
        msg,
        message_id,
        reason,
        cause.to_string(),
        cause.code(),
        attempts,
        received_at,
        ctx.source_service,
    );

    if let Err(e) = ctx.dead_letters.dead_letter(&envelope).await {
        metrics::record_message_outcome("rewound");
        error!(
            message_id,
            partition = msg.partition,
            offset = msg.offset,
            error = %e,
            "死信写入失败，消息将重新投递"
        );
        return Err(e);
    }

    metrics::record_message_outcome("dead_lettered");
    info!(
        message_id,
        partition = msg.partition,
        offset = msg.offset,
        reason = %reason,
        attempts,
        "DEAD_LETTERED order.created 消息"
    );
    Ok(DeliveryOutcome::DeadLettered { attempts, reason })
}

/// order.created 消费者
pub struct OrderCreatedConsumer {
    consumer: KafkaConsumer,
    handler: OrderCreatedHandler,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry_policy: RetryPolicy,
    source_service: String,
}

impl OrderCreatedConsumer {
    pub fn new(
        config: &AppConfig,
        handler: OrderCreatedHandler,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Result<Self, RelayError> {
        Ok(Self {
            consumer: KafkaConsumer::new(&config.kafka)?,
            handler,
            dead_letters,
            retry_policy: RetryPolicy::from(&config.retry),
            source_service: config.service_name.clone(),
        })
    }

    /// 订阅 order.created 并运行到收到关闭信号
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
        let Self {
            consumer,
            handler,
            dead_letters,
            retry_policy,
            source_service,
        } = self;

        consumer.subscribe(&[topics::ORDER_CREATED])?;

        let ctx = DeliveryContext {
            handler: &handler,
            dead_letters: dead_letters.as_ref(),
            retry_policy: &retry_policy,
            source_service: &source_service,
        };

        consumer
            .start(shutdown, &retry_policy, |msg| {
                let ctx = &ctx;
                async move { deliver(ctx, &msg).await.map(|_| ()) }
            })
            .await;

        info!("order.created 消费者已停止");
        Ok(())
    }
}

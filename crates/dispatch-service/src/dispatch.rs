//! 调度编排
//!
//! 给定一条 OrderCreated 及其路由键，先校验库存，再依次发布
//! Preparing → Dispatched → Completed 三个事件。每一步都要等到 broker
//! 确认后才进行下一步；任一步失败立即中止，之前已确认的事件保持生效。
//!
//! 编排层不做任何重试判断，只为失败附加步骤上下文，分类交给处理器。

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDate;
use dispatch_shared::config::StockCheckMode;
use dispatch_shared::events::{
    DispatchCompleted, DispatchEvent, DispatchPreparing, OrderCreated, OrderDispatched,
};
use dispatch_shared::observability::metrics;
use dispatch_shared::publisher::EventPublisher;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{DispatchError, DispatchStep};
use crate::stock_client::StockChecker;

/// 中继实例 ID
///
/// 进程启动时生成一次，写入每条 OrderDispatched 的 processedById，不持久化。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApplicationId(Uuid);

impl ApplicationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for ApplicationId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 调度编排接口，处理器只依赖这个 trait
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn process(&self, key: &str, event: &OrderCreated) -> Result<(), DispatchError>;
}

fn local_today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

/// 调度编排服务
///
/// 不持有可变的请求级状态，可通过 `Arc` 在多个消费者之间共享。
pub struct DispatchService {
    publisher: Arc<dyn EventPublisher>,
    stock_checker: Arc<dyn StockChecker>,
    application_id: ApplicationId,
    stock_check: StockCheckMode,
    clock: fn() -> NaiveDate,
}

impl DispatchService {
    pub fn new(
        publisher: Arc<dyn EventPublisher>,
        stock_checker: Arc<dyn StockChecker>,
        application_id: ApplicationId,
    ) -> Self {
        Self {
            publisher,
            stock_checker,
            application_id,
            stock_check: StockCheckMode::default(),
            clock: local_today,
        }
    }

    pub fn with_stock_check(mut self, mode: StockCheckMode) -> Self {
        self.stock_check = mode;
        self
    }

    /// 替换 dispatchedDate 的日期来源
    pub fn with_clock(mut self, clock: fn() -> NaiveDate) -> Self {
        self.clock = clock;
        self
    }

    pub fn application_id(&self) -> ApplicationId {
        self.application_id
    }

    async fn ensure_in_stock(&self, event: &OrderCreated) -> Result<(), DispatchError> {
        let start = Instant::now();
        let result = self.stock_checker.check_availability(&event.item).await;
        let elapsed = start.elapsed().as_secs_f64();

        match result {
            Ok(true) => {
                metrics::record_stock_check("available", elapsed);
                Ok(())
            }
            Ok(false) => {
                metrics::record_stock_check("unavailable", elapsed);
                warn!(order_id = %event.order_id, item = %event.item, "商品库存不足");
                Err(DispatchError::OutOfStock {
                    item: event.item.clone(),
                })
            }
            Err(source) => {
                metrics::record_stock_check("error", elapsed);
                Err(DispatchError::StockCheck {
                    item: event.item.clone(),
                    source,
                })
            }
        }
    }

    /// 发布一步并等待确认
    async fn publish(
        &self,
        step: DispatchStep,
        key: &str,
        event: DispatchEvent,
    ) -> Result<(), DispatchError> {
        let start = Instant::now();
        let result = self.publisher.publish(step.topic(), key, &event).await;
        let elapsed = start.elapsed().as_secs_f64();

        match result {
            Ok(ack) => {
                metrics::record_publish(event.event_type(), "ok", elapsed);
                debug!(
                    step = %step,
                    topic = %ack.topic,
                    partition = ack.partition,
                    offset = ack.offset,
                    "事件已确认"
                );
                Ok(())
            }
            Err(source) => {
                metrics::record_publish(event.event_type(), "error", elapsed);
                Err(DispatchError::Publish { step, source })
            }
        }
    }
}

#[async_trait]
impl Dispatcher for DispatchService {
    #[instrument(skip(self, event), fields(order_id = %event.order_id))]
    async fn process(&self, key: &str, event: &OrderCreated) -> Result<(), DispatchError> {
        if event.item.trim().is_empty() {
            return Err(DispatchError::InvalidEvent("item 不能为空".to_string()));
        }

        let order_id = event.order_id;

        if self.stock_check == StockCheckMode::BeforePreparing {
            self.ensure_in_stock(event).await?;
        }

        self.publish(
            DispatchStep::Preparing,
            key,
            DispatchPreparing { order_id }.into(),
        )
        .await?;

        if self.stock_check == StockCheckMode::AfterPreparing {
            self.ensure_in_stock(event).await?;
        }

        self.publish(
            DispatchStep::Dispatched,
            key,
            OrderDispatched {
                order_id,
                processed_by_id: self.application_id.as_uuid(),
                notes: format!("Dispatched: {}", event.item),
            }
            .into(),
        )
        .await?;

        self.publish(
            DispatchStep::Completed,
            key,
            DispatchCompleted {
                order_id,
                dispatched_date: (self.clock)().to_string(),
            }
            .into(),
        )
        .await?;

        info!(
            key,
            order_id = %order_id,
            processed_by_id = %self.application_id,
            "订单调度事件已全部发布"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stock_client::MockStockChecker;
    use dispatch_shared::error::RelayError;
    use dispatch_shared::kafka::topics;
    use dispatch_shared::test_utils::{RecordingPublisher, TestEventData};

    fn fixed_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn in_stock() -> MockStockChecker {
        let mut checker = MockStockChecker::new();
        checker
            .expect_check_availability()
            .returning(|_| Ok(true));
        checker
    }

    fn service(publisher: &RecordingPublisher, checker: MockStockChecker) -> DispatchService {
        DispatchService::new(
            Arc::new(publisher.clone()),
            Arc::new(checker),
            ApplicationId::generate(),
        )
        .with_clock(fixed_date)
    }

    #[tokio::test]
    async fn test_process_publishes_three_events_in_order() {
        let publisher = RecordingPublisher::new();
        let service = service(&publisher, in_stock());
        let app_id = service.application_id().as_uuid();
        let event = TestEventData::order_created(Uuid::new_v4(), "Book");

        service.process("order-key", &event).await.unwrap();

        let published = publisher.published().await;
        assert_eq!(published.len(), 3);
        assert!(published.iter().all(|p| p.key == "order-key"));
        assert!(published.iter().all(|p| p.event.order_id() == event.order_id));

        assert_eq!(published[0].topic, topics::DISPATCH_TRACKING);
        assert_eq!(
            published[0].event,
            DispatchEvent::Preparing(DispatchPreparing {
                order_id: event.order_id
            })
        );

        assert_eq!(published[1].topic, topics::ORDER_DISPATCHED);
        assert_eq!(
            published[1].event,
            DispatchEvent::Dispatched(OrderDispatched {
                order_id: event.order_id,
                processed_by_id: app_id,
                notes: "Dispatched: Book".to_string(),
            })
        );

        assert_eq!(published[2].topic, topics::DISPATCH_TRACKING);
        assert_eq!(
            published[2].event,
            DispatchEvent::Completed(DispatchCompleted {
                order_id: event.order_id,
                dispatched_date: "2024-03-01".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_failure_at_each_step_stops_sequence() {
        let cases = [
            ("DispatchPreparing", DispatchStep::Preparing, 0),
            ("OrderDispatched", DispatchStep::Dispatched, 1),
            ("DispatchCompleted", DispatchStep::Completed, 2),
        ];

        for (event_type, expected_step, confirmed_before) in cases {
            let publisher = RecordingPublisher::new();
            publisher
                .fail_on(event_type, RelayError::Kafka("broker 超时".to_string()))
                .await;
            let service = service(&publisher, in_stock());
            let event = TestEventData::random_order_created();

            let err = service.process("k", &event).await.unwrap_err();

            match err {
                DispatchError::Publish { step, source } => {
                    assert_eq!(step, expected_step);
                    assert_eq!(source, RelayError::Kafka("broker 超时".to_string()));
                }
                other => panic!("unexpected error: {other:?}"),
            }
            assert_eq!(publisher.published().await.len(), confirmed_before);
            // 失败那一步之后不再尝试任何发布
            assert_eq!(publisher.attempts().await.len(), confirmed_before + 1);
        }
    }

    #[tokio::test]
    async fn test_out_of_stock_publishes_nothing() {
        let publisher = RecordingPublisher::new();
        let mut checker = MockStockChecker::new();
        checker
            .expect_check_availability()
            .times(1)
            .returning(|_| Ok(false));
        let service = service(&publisher, checker);
        let event = TestEventData::order_created(Uuid::new_v4(), "Lamp");

        let err = service.process("k", &event).await.unwrap_err();

        assert!(matches!(err, DispatchError::OutOfStock { ref item } if item == "Lamp"));
        assert!(publisher.attempts().await.is_empty());
    }

    #[tokio::test]
    async fn test_stock_check_failure_keeps_source() {
        let publisher = RecordingPublisher::new();
        let mut checker = MockStockChecker::new();
        checker.expect_check_availability().returning(|_| {
            Err(RelayError::ExternalServiceTimeout {
                service: "stock-service".to_string(),
            })
        });
        let service = service(&publisher, checker);

        let err = service
            .process("k", &TestEventData::random_order_created())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::StockCheck {
                source: RelayError::ExternalServiceTimeout { .. },
                ..
            }
        ));
        assert!(publisher.attempts().await.is_empty());
    }

    #[tokio::test]
    async fn test_after_preparing_mode_publishes_preparing_first() {
        let publisher = RecordingPublisher::new();
        let mut checker = MockStockChecker::new();
        checker
            .expect_check_availability()
            .times(1)
            .returning(|_| Ok(false));
        let service =
            service(&publisher, checker).with_stock_check(StockCheckMode::AfterPreparing);

        let err = service
            .process("k", &TestEventData::random_order_created())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::OutOfStock { .. }));
        assert_eq!(publisher.published_types().await, vec!["DispatchPreparing"]);
    }

    #[tokio::test]
    async fn test_disabled_mode_skips_stock_checker() {
        let publisher = RecordingPublisher::new();
        let mut checker = MockStockChecker::new();
        checker.expect_check_availability().never();
        let service = service(&publisher, checker).with_stock_check(StockCheckMode::Disabled);

        service
            .process("k", &TestEventData::random_order_created())
            .await
            .unwrap();

        assert_eq!(publisher.published().await.len(), 3);
    }

    #[tokio::test]
    async fn test_blank_item_is_invalid() {
        let publisher = RecordingPublisher::new();
        let mut checker = MockStockChecker::new();
        checker.expect_check_availability().never();
        let service = service(&publisher, checker);
        let event = TestEventData::order_created(Uuid::new_v4(), "   ");

        let err = service.process("k", &event).await.unwrap_err();

        assert!(matches!(err, DispatchError::InvalidEvent(_)));
        assert!(publisher.attempts().await.is_empty());
    }

    #[test]
    fn test_application_id_is_random() {
        assert_ne!(ApplicationId::generate(), ApplicationId::generate());
        let id = Uuid::new_v4();
        assert_eq!(ApplicationId::from(id).to_string(), id.to_string());
    }
}

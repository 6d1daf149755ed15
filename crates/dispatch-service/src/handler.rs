//! order.created 入站处理器
//!
//! 把调度编排的失败映射为可重试 / 不可重试两类信号，
//! 这是整个服务中唯一做分类判断的地方。

use std::sync::Arc;

use dispatch_shared::config::OutOfStockPolicy;
use dispatch_shared::error::RelayError;
use dispatch_shared::events::OrderCreated;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{DispatchError, HandlerError};

/// 一次失败的处置方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 瞬时故障，重新投递
    Retry,
    /// 毒消息，进入死信队列
    Reject,
    /// 吞掉错误并确认消息
    Acknowledge,
}

/// 纯函数分类：同样的错误与策略总是得到同样的结果
pub fn classify(error: &DispatchError, out_of_stock: OutOfStockPolicy) -> Disposition {
    match error {
        DispatchError::InvalidEvent(_) | DispatchError::MalformedPayload(_) => Disposition::Reject,
        DispatchError::OutOfStock { .. } => match out_of_stock {
            OutOfStockPolicy::Reject => Disposition::Reject,
            OutOfStockPolicy::Retry => Disposition::Retry,
            OutOfStockPolicy::Skip => Disposition::Acknowledge,
        },
        DispatchError::StockCheck { source, .. } | DispatchError::Publish { source, .. } => {
            classify_source(source)
        }
    }
}

fn classify_source(source: &RelayError) -> Disposition {
    match source {
        // 负载或下游应答本身有问题，重投也不会变
        RelayError::Serialization(_) | RelayError::ExternalService { .. } => Disposition::Reject,
        RelayError::Kafka(_)
        | RelayError::ExternalServiceUnavailable { .. }
        | RelayError::ExternalServiceTimeout { .. }
        | RelayError::Config(_)
        | RelayError::Internal(_) => Disposition::Retry,
    }
}

/// order.created 处理器
pub struct OrderCreatedHandler {
    dispatcher: Arc<dyn Dispatcher>,
    out_of_stock: OutOfStockPolicy,
}

impl OrderCreatedHandler {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, out_of_stock: OutOfStockPolicy) -> Self {
        Self {
            dispatcher,
            out_of_stock,
        }
    }

    /// 处理一条已解码的事件
    pub async fn listen(
        &self,
        partition: i32,
        key: &str,
        event: &OrderCreated,
    ) -> Result<(), HandlerError> {
        info!(
            partition,
            key,
            order_id = %event.order_id,
            item = %event.item,
            "收到 order.created 事件"
        );

        let Err(err) = self.dispatcher.process(key, event).await else {
            return Ok(());
        };

        match classify(&err, self.out_of_stock) {
            Disposition::Retry => {
                warn!(
                    key,
                    order_id = %event.order_id,
                    code = err.code(),
                    error = %err,
                    "调度失败，可重试"
                );
                Err(HandlerError::Retryable(err))
            }
            Disposition::Reject => {
                warn!(
                    key,
                    order_id = %event.order_id,
                    code = err.code(),
                    error = %err,
                    "调度失败，不可重试"
                );
                Err(HandlerError::NotRetryable(err))
            }
            Disposition::Acknowledge => {
                info!(
                    key,
                    order_id = %event.order_id,
                    error = %err,
                    "商品缺货，跳过调度并确认消息"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MockDispatcher;
    use crate::error::DispatchStep;
    use dispatch_shared::test_utils::TestEventData;

    fn handler_failing_with(
        err: fn() -> DispatchError,
        policy: OutOfStockPolicy,
    ) -> OrderCreatedHandler {
        let mut dispatcher = MockDispatcher::new();
        dispatcher
            .expect_process()
            .times(1)
            .returning(move |_, _| Err(err()));
        OrderCreatedHandler::new(Arc::new(dispatcher), policy)
    }

    #[tokio::test]
    async fn test_listen_success() {
        let mut dispatcher = MockDispatcher::new();
        dispatcher.expect_process().times(1).returning(|_, _| Ok(()));
        let handler = OrderCreatedHandler::new(Arc::new(dispatcher), OutOfStockPolicy::Reject);

        let result = handler
            .listen(0, "k", &TestEventData::random_order_created())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_transient_publish_failure_is_retryable() {
        let handler = handler_failing_with(
            || DispatchError::Publish {
                step: DispatchStep::Dispatched,
                source: RelayError::Kafka("超时".to_string()),
            },
            OutOfStockPolicy::Reject,
        );

        let err = handler
            .listen(0, "k", &TestEventData::random_order_created())
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(matches!(
            err.cause(),
            DispatchError::Publish {
                step: DispatchStep::Dispatched,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stock_service_down_is_retryable() {
        let handler = handler_failing_with(
            || DispatchError::StockCheck {
                item: "Book".to_string(),
                source: RelayError::ExternalServiceUnavailable {
                    service: "stock-service".to_string(),
                    message: "HTTP 503".to_string(),
                },
            },
            OutOfStockPolicy::Reject,
        );

        let err = handler
            .listen(0, "k", &TestEventData::random_order_created())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Retryable(_)));
    }

    #[tokio::test]
    async fn test_domain_rejection_is_not_retryable() {
        let handler = handler_failing_with(
            || DispatchError::OutOfStock {
                item: "Book".to_string(),
            },
            OutOfStockPolicy::Reject,
        );

        let err = handler
            .listen(0, "k", &TestEventData::random_order_created())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HandlerError::NotRetryable(DispatchError::OutOfStock { .. })
        ));
    }

    #[tokio::test]
    async fn test_skip_policy_acknowledges_out_of_stock() {
        let handler = handler_failing_with(
            || DispatchError::OutOfStock {
                item: "Book".to_string(),
            },
            OutOfStockPolicy::Skip,
        );

        let result = handler
            .listen(0, "k", &TestEventData::random_order_created())
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_classification_table() {
        let reject = OutOfStockPolicy::Reject;

        assert_eq!(
            classify(&DispatchError::InvalidEvent("x".into()), reject),
            Disposition::Reject
        );
        assert_eq!(
            classify(&DispatchError::MalformedPayload("x".into()), reject),
            Disposition::Reject
        );
        assert_eq!(
            classify(
                &DispatchError::StockCheck {
                    item: "x".into(),
                    source: RelayError::ExternalService {
                        service: "stock-service".into(),
                        message: "HTTP 404".into(),
                    },
                },
                reject
            ),
            Disposition::Reject
        );
        assert_eq!(
            classify(
                &DispatchError::Publish {
                    step: DispatchStep::Preparing,
                    source: RelayError::Serialization("bad".into()),
                },
                reject
            ),
            Disposition::Reject
        );
        assert_eq!(
            classify(
                &DispatchError::Publish {
                    step: DispatchStep::Completed,
                    source: RelayError::Internal("x".into()),
                },
                reject
            ),
            Disposition::Retry
        );

        let out_of_stock = DispatchError::OutOfStock { item: "x".into() };
        assert_eq!(
            classify(&out_of_stock, OutOfStockPolicy::Retry),
            Disposition::Retry
        );
        assert_eq!(
            classify(&out_of_stock, OutOfStockPolicy::Skip),
            Disposition::Acknowledge
        );
    }

    #[test]
    fn test_classification_is_deterministic() {
        let err = DispatchError::StockCheck {
            item: "x".into(),
            source: RelayError::ExternalServiceTimeout {
                service: "stock-service".into(),
            },
        };
        let first = classify(&err, OutOfStockPolicy::Reject);
        for _ in 0..10 {
            assert_eq!(classify(&err, OutOfStockPolicy::Reject), first);
        }
        assert_eq!(first, Disposition::Retry);
    }
}

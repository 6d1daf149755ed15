//! 订单调度中继服务
//!
//! 消费 `order.created` 事件，校验库存后按固定顺序发布
//! DispatchPreparing、OrderDispatched、DispatchCompleted 三个下游事件。
//! 处理失败时由处理器判定可重试或不可重试，消费层据此重新投递或写入死信队列。

pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod stock_client;

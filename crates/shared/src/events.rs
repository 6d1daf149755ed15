//! 事件模型
//!
//! 定义调度中继消费与发布的全部事件记录。字段以 camelCase 序列化，
//! 与上下游的订单服务、追踪服务保持一致的 JSON 契约。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::kafka::topics;

// ---------------------------------------------------------------------------
// 入站事件
// ---------------------------------------------------------------------------

/// 订单已创建事件（由上游订单服务发布）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub item: String,
}

impl OrderCreated {
    pub fn new(order_id: Uuid, item: impl Into<String>) -> Self {
        Self {
            order_id,
            item: item.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// 出站事件
// ---------------------------------------------------------------------------

/// 追踪事件：准备发货
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchPreparing {
    pub order_id: Uuid,
}

/// 发货决定本身，发布到独立的 dispatch topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDispatched {
    pub order_id: Uuid,
    /// 处理该订单的中继实例 ID
    pub processed_by_id: Uuid,
    pub notes: String,
}

/// 追踪事件：发货完成
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchCompleted {
    pub order_id: Uuid,
    /// ISO 日期，如 2024-03-01
    pub dispatched_date: String,
}

/// 出站事件的统一表示
///
/// 序列化时透明输出内部记录；事件类型通过消息头 `eventType` 传递，
/// 让同一追踪 topic 上的消费者能区分 Preparing 与 Completed。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DispatchEvent {
    Preparing(DispatchPreparing),
    Dispatched(OrderDispatched),
    Completed(DispatchCompleted),
}

impl DispatchEvent {
    /// 消息头中的事件类型名
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Preparing(_) => "DispatchPreparing",
            Self::Dispatched(_) => "OrderDispatched",
            Self::Completed(_) => "DispatchCompleted",
        }
    }

    /// 事件所属的目标 topic
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Preparing(_) | Self::Completed(_) => topics::DISPATCH_TRACKING,
            Self::Dispatched(_) => topics::ORDER_DISPATCHED,
        }
    }

    pub fn order_id(&self) -> Uuid {
        match self {
            Self::Preparing(e) => e.order_id,
            Self::Dispatched(e) => e.order_id,
            Self::Completed(e) => e.order_id,
        }
    }
}

impl From<DispatchPreparing> for DispatchEvent {
    fn from(event: DispatchPreparing) -> Self {
        Self::Preparing(event)
    }
}

impl From<OrderDispatched> for DispatchEvent {
    fn from(event: OrderDispatched) -> Self {
        Self::Dispatched(event)
    }
}

impl From<DispatchCompleted> for DispatchEvent {
    fn from(event: DispatchCompleted) -> Self {
        Self::Completed(event)
    }
}

//! 调度服务专用错误类型
//!
//! `DispatchError` 描述调度流程在哪一步、因为什么失败，不带任何重试判断；
//! `HandlerError` 是唯一的分类边界，消费重试层只根据它的标签行动。

use std::fmt;

use dispatch_shared::error::RelayError;
use dispatch_shared::kafka::topics;

/// 调度序列中的发布步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchStep {
    Preparing,
    Dispatched,
    Completed,
}

impl DispatchStep {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Preparing | Self::Completed => topics::DISPATCH_TRACKING,
            Self::Dispatched => topics::ORDER_DISPATCHED,
        }
    }
}

impl fmt::Display for DispatchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Preparing => "DispatchPreparing",
            Self::Dispatched => "OrderDispatched",
            Self::Completed => "DispatchCompleted",
        };
        f.write_str(s)
    }
}

/// 调度流程错误
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// 事件字段不合法（如商品名为空）
    #[error("订单事件无效: {0}")]
    InvalidEvent(String),

    /// 消息负载无法解码为 OrderCreated
    #[error("消息负载无法解析: {0}")]
    MalformedPayload(String),

    #[error("库存不足: item={item}")]
    OutOfStock { item: String },

    /// 库存服务调用本身失败
    #[error("库存校验失败: item={item}, {source}")]
    StockCheck {
        item: String,
        #[source]
        source: RelayError,
    },

    /// 某一步发布未得到 broker 确认；之前的步骤已经生效
    #[error("{step} 事件发布失败: {source}")]
    Publish {
        step: DispatchStep,
        #[source]
        source: RelayError,
    },
}

impl DispatchError {
    /// 错误码，写入日志与死信信封
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidEvent(_) => "INVALID_EVENT",
            Self::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            Self::OutOfStock { .. } => "OUT_OF_STOCK",
            Self::StockCheck { source, .. } | Self::Publish { source, .. } => source.code(),
        }
    }
}

/// 处理器向消费重试层发出的信号
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// 瞬时故障，同一条消息应按退避策略重新投递
    #[error("可重试错误: {0}")]
    Retryable(DispatchError),

    /// 毒消息，不得重新投递，直接进入死信队列
    #[error("不可重试错误: {0}")]
    NotRetryable(DispatchError),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn cause(&self) -> &DispatchError {
        match self {
            Self::Retryable(e) | Self::NotRetryable(e) => e,
        }
    }
}

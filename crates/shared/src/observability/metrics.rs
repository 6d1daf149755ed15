//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 与 `/health` 端点。
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_common_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册指标描述，出现在 /metrics 端点的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "dispatch_messages_total",
        "Inbound order.created messages by terminal outcome"
    );
    metrics::describe_counter!(
        "dispatch_publishes_total",
        "Outbound dispatch event publishes by step and status"
    );
    metrics::describe_histogram!(
        "dispatch_publish_duration_seconds",
        "Time from publish to broker acknowledgement"
    );
    metrics::describe_counter!("dispatch_retries_total", "Redeliveries of retryable failures");
    metrics::describe_counter!("stock_checks_total", "Stock availability checks by result");
    metrics::describe_histogram!(
        "stock_check_duration_seconds",
        "Stock availability check duration in seconds"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 指标记录函数
// ============================================================================

/// 记录入站消息的终态（committed / dead_lettered / rewound）
#[inline]
pub fn record_message_outcome(outcome: &str) {
    metrics::counter!("dispatch_messages_total", "outcome" => outcome.to_string()).increment(1);
}

/// 记录一次出站发布
#[inline]
pub fn record_publish(event_type: &str, status: &str, duration_secs: f64) {
    metrics::counter!(
        "dispatch_publishes_total",
        "event_type" => event_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "dispatch_publish_duration_seconds",
        "event_type" => event_type.to_string()
    )
    .record(duration_secs);
}

/// 记录重新投递次数
#[inline]
pub fn record_retries(count: u32) {
    if count > 0 {
        metrics::counter!("dispatch_retries_total").increment(u64::from(count));
    }
}

/// 记录库存校验（available / unavailable / error）
#[inline]
pub fn record_stock_check(result: &str, duration_secs: f64) {
    metrics::counter!("stock_checks_total", "result" => result.to_string()).increment(1);
    metrics::histogram!("stock_check_duration_seconds").record(duration_secs);
}

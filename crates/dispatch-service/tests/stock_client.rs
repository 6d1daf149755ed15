//! 库存服务客户端集成测试
//!
//! 在本地端口启动 axum 桩服务，验证 HTTP 结果到错误类型的映射。

use std::collections::HashMap;
use std::time::Duration;

use axum::{Router, extract::Query, http::StatusCode, routing::get};
use dispatch_service::stock_client::{StockChecker, StockServiceClient};
use dispatch_shared::config::StockServiceConfig;
use dispatch_shared::error::RelayError;
use tokio::net::TcpListener;

/// 按 item 返回不同应答的桩服务
async fn stock_endpoint(Query(params): Query<HashMap<String, String>>) -> (StatusCode, String) {
    match params.get("item").map(String::as_str) {
        Some("book") => (StatusCode::OK, "true".to_string()),
        Some("lamp") => (StatusCode::OK, "false".to_string()),
        Some("broken") => (StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string()),
        Some("garbage") => (StatusCode::OK, "perhaps".to_string()),
        Some("slow") => {
            tokio::time::sleep(Duration::from_millis(500)).await;
            (StatusCode::OK, "true".to_string())
        }
        _ => (StatusCode::NOT_FOUND, String::new()),
    }
}

async fn start_stub() -> String {
    let app = Router::new().route("/api/stock", get(stock_endpoint));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn client(base_url: String) -> StockServiceClient {
    StockServiceClient::new(&StockServiceConfig {
        base_url,
        timeout_ms: 100,
    })
    .unwrap()
}

#[tokio::test]
async fn test_available_and_unavailable() {
    let client = client(start_stub().await);

    assert_eq!(client.check_availability("book").await, Ok(true));
    assert_eq!(client.check_availability("lamp").await, Ok(false));
}

#[tokio::test]
async fn test_server_error_is_unavailable() {
    let client = client(start_stub().await);

    let err = client.check_availability("broken").await.unwrap_err();
    assert!(matches!(err, RelayError::ExternalServiceUnavailable { .. }));
}

#[tokio::test]
async fn test_client_error_is_permanent() {
    let client = client(start_stub().await);

    let err = client.check_availability("unknown").await.unwrap_err();
    assert!(matches!(err, RelayError::ExternalService { .. }));
}

#[tokio::test]
async fn test_unparseable_body_is_permanent() {
    let client = client(start_stub().await);

    let err = client.check_availability("garbage").await.unwrap_err();
    assert!(matches!(err, RelayError::ExternalService { .. }));
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let client = client(start_stub().await);

    let err = client.check_availability("slow").await.unwrap_err();
    assert_eq!(
        err,
        RelayError::ExternalServiceTimeout {
            service: "stock-service".to_string()
        }
    );
}

#[tokio::test]
async fn test_connection_refused_is_unavailable() {
    // 绑定后立即释放端口，保证没有服务监听
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client(format!("http://{addr}"));
    let err = client.check_availability("book").await.unwrap_err();
    assert!(matches!(err, RelayError::ExternalServiceUnavailable { .. }));
}

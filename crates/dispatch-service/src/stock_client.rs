//! 库存服务 HTTP 客户端
//!
//! 通过 `StockChecker` trait 抽象库存查询，便于测试时注入 mock 实现。
//! 客户端只负责把 HTTP 结果翻译成 `RelayError` 的具体变体，
//! 是否重试由处理器根据变体决定。

use std::time::Duration;

use async_trait::async_trait;
use dispatch_shared::config::StockServiceConfig;
use dispatch_shared::error::RelayError;
use tracing::debug;

const SERVICE_NAME: &str = "stock-service";

/// 库存可用性查询接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StockChecker: Send + Sync {
    /// 商品有货时返回 `Ok(true)`；调用失败返回错误
    async fn check_availability(&self, item: &str) -> Result<bool, RelayError>;
}

/// 库存服务客户端
///
/// `GET {base_url}/api/stock?item=...`，响应体为 `true` 或 `false`。
/// reqwest::Client 内部带连接池，可在并发调用间共享。
pub struct StockServiceClient {
    http: reqwest::Client,
    endpoint: String,
}

impl StockServiceClient {
    pub fn new(config: &StockServiceConfig) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| RelayError::Config(format!("创建库存服务 HTTP 客户端失败: {e}")))?;

        Ok(Self {
            http,
            endpoint: format!("{}/api/stock", config.base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl StockChecker for StockServiceClient {
    async fn check_availability(&self, item: &str) -> Result<bool, RelayError> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("item", item)])
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(RelayError::ExternalServiceUnavailable {
                service: SERVICE_NAME.to_string(),
                message: format!("HTTP {status}"),
            });
        }
        if !status.is_success() {
            return Err(RelayError::ExternalService {
                service: SERVICE_NAME.to_string(),
                message: format!("HTTP {status}"),
            });
        }

        let body = response.text().await.map_err(transport_error)?;
        let available = parse_availability(&body)?;

        debug!(item, available, "库存查询完成");
        Ok(available)
    }
}

/// 传输层错误：超时单独区分，其余（连接失败、连接中断）视为服务不可用
fn transport_error(err: reqwest::Error) -> RelayError {
    if err.is_timeout() {
        RelayError::ExternalServiceTimeout {
            service: SERVICE_NAME.to_string(),
        }
    } else {
        RelayError::ExternalServiceUnavailable {
            service: SERVICE_NAME.to_string(),
            message: err.to_string(),
        }
    }
}

fn parse_availability(body: &str) -> Result<bool, RelayError> {
    match body.trim() {
        b if b.eq_ignore_ascii_case("true") => Ok(true),
        b if b.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(RelayError::ExternalService {
            service: SERVICE_NAME.to_string(),
            message: format!("无法识别的库存响应: {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_availability() {
        assert_eq!(parse_availability("true"), Ok(true));
        assert_eq!(parse_availability(" FALSE\n"), Ok(false));
        assert!(matches!(
            parse_availability("maybe"),
            Err(RelayError::ExternalService { .. })
        ));
        assert!(parse_availability("").is_err());
    }

    #[test]
    fn test_endpoint_normalizes_trailing_slash() {
        let client = StockServiceClient::new(&StockServiceConfig {
            base_url: "http://stock:9001/".to_string(),
            timeout_ms: 100,
        })
        .unwrap();
        assert_eq!(client.endpoint, "http://stock:9001/api/stock");
    }
}

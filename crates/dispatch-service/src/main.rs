//! 调度中继服务
//!
//! 消费 order.created 事件，校验库存后依次发布调度追踪事件。

use std::sync::Arc;

use anyhow::Result;
use dispatch_shared::{config::AppConfig, dlq::DlqProducer, kafka::KafkaProducer, observability};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use dispatch_service::{
    consumer::OrderCreatedConsumer,
    dispatch::{ApplicationId, DispatchService},
    handler::OrderCreatedHandler,
    stock_client::StockServiceClient,
};

const SERVICE_NAME: &str = "dispatch-service";

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置：default.toml → {env}.toml → dispatch-service.toml → 环境变量
    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        // 日志尚未初始化
        eprintln!("Failed to load config, using defaults: {e}");
        AppConfig {
            service_name: SERVICE_NAME.to_string(),
            ..AppConfig::default()
        }
    });

    // 2. 初始化日志与指标
    let _guard = observability::init(&config.service_name, &config.observability).await?;

    let application_id = ApplicationId::generate();
    info!(
        environment = %config.environment,
        application_id = %application_id,
        "Starting dispatch-service..."
    );

    // 3. 外部协作者
    let producer = KafkaProducer::new(&config.kafka)?;
    let stock_client = Arc::new(StockServiceClient::new(&config.stock_service)?);
    info!(base_url = %config.stock_service.base_url, "Stock service client initialized");

    // 4. 调度编排与处理器
    let dispatcher = Arc::new(
        DispatchService::new(Arc::new(producer.clone()), stock_client, application_id)
            .with_stock_check(config.dispatch.stock_check),
    );
    let handler = OrderCreatedHandler::new(dispatcher, config.dispatch.out_of_stock);

    // 5. 消费者与死信
    let dead_letters = Arc::new(DlqProducer::new(producer));
    let consumer = OrderCreatedConsumer::new(&config, handler, dead_letters)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        if shutdown_tx.send(true).is_err() {
            error!("Consumer already stopped before shutdown signal");
        }
    });

    info!(
        max_retries = config.retry.max_retries,
        stock_check = ?config.dispatch.stock_check,
        out_of_stock = ?config.dispatch.out_of_stock,
        "dispatch-service started"
    );

    consumer.run(shutdown_rx).await?;

    info!("Service shutdown complete");
    Ok(())
}

/// 等待关闭信号（Ctrl+C 或 SIGTERM）
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}

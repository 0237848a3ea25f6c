use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mock_service=info,tower_http=info")),
        )
        .init();

    let addr: SocketAddr = std::env::var("MOCK_SERVICE_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()?;

    if let Ok(metrics_addr) = std::env::var("MOCK_SERVICE_METRICS_ADDR") {
        PrometheusBuilder::new()
            .with_http_listener(metrics_addr.parse::<SocketAddr>()?)
            .install()?;
    }

    tokio::spawn(mock_service::tps_measure_task());
    mock_service::run(addr).await
}

use crate::metrics::ProxyMetrics;
use crate::Result;
use axum::{extract::State, http::header, http::StatusCode, response::IntoResponse, routing::get, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// HTTP endpoint serving the text exposition on `GET /metrics`
pub struct PrometheusExporter {
    metrics: ProxyMetrics,
    listener: TcpListener,
}

impl PrometheusExporter {
    pub async fn bind(metrics: ProxyMetrics, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { metrics, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn router(metrics: ProxyMetrics) -> Router {
        Router::new()
            .route("/metrics", get(scrape))
            .with_state(metrics)
    }

    pub async fn serve(self, shutdown: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Starting Prometheus exporter on {}", addr);
        }

        let router = Self::router(self.metrics);
        if let Err(e) = axum::serve(self.listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
        {
            warn!("Prometheus exporter stopped: {}", e);
        }
    }
}

async fn scrape(State(metrics): State<ProxyMetrics>) -> impl IntoResponse {
    match metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to render metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub mod collector;
pub mod exporter;

pub use collector::ProxyMetrics;
pub use exporter::PrometheusExporter;

use crate::config::{LogFormat, TelemetryConfig};
use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub fn init(config: &TelemetryConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    if config.metrics_enabled {
        let addr: SocketAddr = ([0, 0, 0, 0], config.metrics_port).into();
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;

        describe_metrics();

        tracing::info!(
            port = config.metrics_port,
            "Metrics endpoint started at http://0.0.0.0:{}/metrics",
            config.metrics_port
        );
    }

    Ok(())
}

fn describe_metrics() {
    describe_counter!("ingester_budget_admitted", "Listing calls admitted by the request budget");
    describe_counter!("ingester_budget_refused", "Listing calls refused because the budget was spent");
    describe_counter!("ingester_pages_fetched", "Pages fetched successfully");
    describe_counter!("ingester_page_soft_failures", "Pages that failed and were treated as empty");
    describe_counter!("ingester_token_exchanges", "Client-credential token exchanges");
    describe_counter!("ingester_records_landed", "Records written to the warehouse");
    describe_histogram!(
        "ingester_fetch_duration_ms",
        Unit::Milliseconds,
        "Latency of a single listing call"
    );
}

pub fn shutdown() {
    tracing::info!("Shutting down telemetry");
}

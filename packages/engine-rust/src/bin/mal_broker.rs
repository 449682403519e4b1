//! Standalone publish-subscribe broker reachable over `maltcp`.

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use mal_core::OperationKey;
use mal_engine::{Broker, ClientContext, Context, ContextConfig, DispatchPolicy, TransportRegistry};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// MAL publish-subscribe broker
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Context URI to bind, e.g. maltcp://0.0.0.0:7000
    #[arg(long, env = "MAL_BROKER_URI", default_value = "maltcp://127.0.0.1:7000")]
    uri: String,

    /// Service name of the broker endpoint under the context URI
    #[arg(long, env = "MAL_BROKER_SERVICE", default_value = "broker")]
    service: String,

    /// Brokered operation as area.version.service.operation (repeatable)
    #[arg(long = "operation", required = true, value_parser = parse_operation)]
    operations: Vec<OperationKey>,

    /// Number of value lists carried by each update
    #[arg(long, default_value_t = 1)]
    value_lists: usize,

    /// Maximum concurrently running handlers; PUBSUB stages are always handled in order
    #[arg(long, default_value_t = 1)]
    max_in_flight: usize,

    /// Log filter directive
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn parse_operation(value: &str) -> Result<OperationKey, String> {
    let parts: Vec<&str> = value.split('.').collect();
    let [area, version, service, operation] = parts.as_slice() else {
        return Err(format!("expected area.version.service.operation, got `{value}`"));
    };
    let number = |part: &str| part.parse::<u16>().map_err(|e| format!("`{part}`: {e}"));
    Ok(OperationKey::new(
        number(area)?,
        version.parse::<u8>().map_err(|e| format!("`{version}`: {e}"))?,
        number(service)?,
        number(operation)?,
    ))
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match args.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let config = ContextConfig {
        dispatch: if args.max_in_flight > 1 {
            DispatchPolicy::Concurrent {
                max_in_flight: args.max_in_flight,
            }
        } else {
            DispatchPolicy::Serial
        },
        ..ContextConfig::default()
    };
    let context = Context::new(args.uri.as_str(), &TransportRegistry::with_defaults(), config)
        .await
        .with_context(|| format!("binding {}", args.uri))?;
    let endpoint = ClientContext::new(&context, &args.service)?;

    let broker = if args.value_lists == 1 {
        Broker::with_value_list()
    } else {
        Broker::with_value_lists(args.value_lists)
    };
    for key in &args.operations {
        broker.attach(&endpoint, *key)?;
        info!(%key, "brokering operation");
    }
    info!(uri = %endpoint.uri(), "broker ready");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    endpoint.close();
    context.close().await;
    Ok(())
}

use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wagerboard_server::provider::AffiliateClient;
use wagerboard_server::scheduler::Scheduler;
use wagerboard_server::store::RaceStore;
use wagerboard_server::{Api, ServerConfig, Wagerboard};
use wagerboard_types::RaceType;

fn init_tracing() -> Result<()> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });

    if let Some(endpoint) = endpoint {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "wagerboard-server".to_string());
        let rate = std::env::var("OTEL_SAMPLING_RATE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("failed to build OTLP exporter")?;
        let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(rate))
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_attributes([opentelemetry::KeyValue::new("service.name", service_name)])
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        let tracer = tracer_provider.tracer("wagerboard-server");
        opentelemetry::global::set_tracer_provider(tracer_provider);

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host interface to bind (default: localhost).
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Base URL of the affiliate data provider.
    #[arg(long)]
    provider_base_url: Option<String>,

    /// Path of the referral leaderboard below the provider base URL.
    #[arg(long)]
    provider_leaderboard_path: Option<String>,

    /// Provider bearer token (falls back to API_TOKEN, then --api-token-file).
    #[arg(long)]
    api_token: Option<String>,

    /// File holding the provider bearer token.
    #[arg(long)]
    api_token_file: Option<PathBuf>,

    /// Provider request timeout in milliseconds (0 uses default).
    #[arg(long)]
    provider_timeout_ms: Option<u64>,

    /// Provider attempts per fetch, including the first (0 uses default).
    #[arg(long)]
    provider_max_attempts: Option<u32>,

    /// First retry backoff in milliseconds (0 uses default).
    #[arg(long)]
    provider_initial_backoff_ms: Option<u64>,

    /// Retry backoff ceiling in milliseconds (0 uses default).
    #[arg(long)]
    provider_max_backoff_ms: Option<u64>,

    /// Seconds a fetched leaderboard stays fresh (0 uses default).
    #[arg(long)]
    cache_ttl_seconds: Option<u64>,

    /// Seconds between scheduler ticks (0 uses default).
    #[arg(long)]
    refresh_interval_seconds: Option<u64>,

    /// Participants kept per race (0 uses default).
    #[arg(long)]
    race_size: Option<usize>,

    /// Race types to run, comma separated (default: monthly).
    #[arg(long, value_delimiter = ',')]
    race_types: Vec<RaceType>,

    /// Prize pool of monthly races.
    #[arg(long)]
    monthly_prize_pool: Option<f64>,

    /// Prize pool of weekly races.
    #[arg(long)]
    weekly_prize_pool: Option<f64>,

    /// Path to SQLite database for races (in-memory when omitted).
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Postgres connection string for races (overrides SQLite path when set).
    #[arg(long)]
    store_url: Option<String>,

    /// Store operation timeout in milliseconds (0 uses default).
    #[arg(long)]
    store_timeout_ms: Option<u64>,

    /// Max queued WebSocket outbound messages per connection (0 uses default).
    #[arg(long)]
    ws_outbound_buffer: Option<usize>,

    /// Max concurrent WebSocket connections (0 disables limit).
    #[arg(long)]
    ws_max_connections: Option<usize>,

    /// Max concurrent WebSocket connections per IP (0 disables limit).
    #[arg(long)]
    ws_max_connections_per_ip: Option<usize>,

    /// Max WebSocket message size in bytes (0 uses default).
    #[arg(long)]
    ws_max_message_bytes: Option<usize>,

    /// WebSocket send timeout in milliseconds (0 uses default).
    #[arg(long)]
    ws_send_timeout_ms: Option<u64>,

    /// Seconds between WebSocket pings (0 uses default).
    #[arg(long)]
    ws_heartbeat_interval_seconds: Option<u64>,

    /// Seconds of client silence before a WebSocket is closed (0 uses default).
    #[arg(long)]
    ws_heartbeat_grace_seconds: Option<u64>,

    /// Redis URL for live update fanout (enables pubsub).
    #[arg(long)]
    fanout_redis_url: Option<String>,

    /// Redis channel for live update fanout.
    #[arg(long)]
    fanout_channel: Option<String>,

    /// Optional fanout origin identifier.
    #[arg(long)]
    fanout_origin: Option<String>,

    /// Publish live updates to fanout channel (default: true).
    #[arg(long, value_parser = clap::value_parser!(bool))]
    fanout_publish: Option<bool>,

    /// Subscribe to fanout channel (default: true).
    #[arg(long, value_parser = clap::value_parser!(bool))]
    fanout_subscribe: Option<bool>,
}

fn is_production() -> bool {
    matches!(
        std::env::var("NODE_ENV").as_deref(),
        Ok("production") | Ok("prod")
    )
}

/// Maps an optional arg value to Option: 0 => None, Some(v) => Some(v), None => default
fn map_optional_limit<T: Copy + PartialEq + From<u8>>(
    arg: Option<T>,
    default: Option<T>,
) -> Option<T> {
    match arg {
        Some(v) if v == T::from(0) => None,
        Some(v) => Some(v),
        None => default,
    }
}

/// Maps an optional arg value keeping default on 0: 0 => default, Some(v) => Some(v), None => default
fn map_optional_default_on_zero<T: Copy + PartialEq + From<u8>>(
    arg: Option<T>,
    default: Option<T>,
) -> Option<T> {
    match arg {
        Some(v) if v == T::from(0) => default,
        Some(v) => Some(v),
        None => default,
    }
}

fn prize_pool(arg: Option<f64>, default: f64, name: &str) -> Result<f64> {
    match arg {
        Some(value) if !value.is_finite() || value < 0.0 => {
            anyhow::bail!("{name} must be a non-negative amount")
        }
        Some(value) => Ok(value),
        None => Ok(default),
    }
}

fn build_config(args: &Args) -> Result<ServerConfig> {
    let defaults = ServerConfig::default();
    let race_types = if args.race_types.is_empty() {
        defaults.race_types.clone()
    } else {
        let mut race_types = Vec::with_capacity(args.race_types.len());
        for race_type in &args.race_types {
            if !race_types.contains(race_type) {
                race_types.push(*race_type);
            }
        }
        race_types
    };
    Ok(ServerConfig {
        provider_base_url: args
            .provider_base_url
            .clone()
            .unwrap_or_else(|| defaults.provider_base_url.clone()),
        provider_leaderboard_path: args
            .provider_leaderboard_path
            .clone()
            .unwrap_or_else(|| defaults.provider_leaderboard_path.clone()),
        api_token: None,
        provider_timeout_ms: map_optional_default_on_zero(args.provider_timeout_ms, defaults.provider_timeout_ms),
        provider_max_attempts: map_optional_default_on_zero(args.provider_max_attempts, defaults.provider_max_attempts),
        provider_initial_backoff_ms: map_optional_default_on_zero(args.provider_initial_backoff_ms, defaults.provider_initial_backoff_ms),
        provider_max_backoff_ms: map_optional_default_on_zero(args.provider_max_backoff_ms, defaults.provider_max_backoff_ms),
        cache_ttl_seconds: map_optional_default_on_zero(args.cache_ttl_seconds, defaults.cache_ttl_seconds),
        refresh_interval_seconds: map_optional_default_on_zero(args.refresh_interval_seconds, defaults.refresh_interval_seconds),
        race_size: map_optional_default_on_zero(args.race_size, defaults.race_size),
        race_types,
        monthly_prize_pool: prize_pool(args.monthly_prize_pool, defaults.monthly_prize_pool, "monthly_prize_pool")?,
        weekly_prize_pool: prize_pool(args.weekly_prize_pool, defaults.weekly_prize_pool, "weekly_prize_pool")?,
        store_path: args.store_path.clone(),
        store_url: args.store_url.clone(),
        store_timeout_ms: map_optional_default_on_zero(args.store_timeout_ms, defaults.store_timeout_ms),
        ws_outbound_buffer: map_optional_default_on_zero(args.ws_outbound_buffer, defaults.ws_outbound_buffer),
        ws_max_connections: map_optional_limit(args.ws_max_connections, defaults.ws_max_connections),
        ws_max_connections_per_ip: map_optional_limit(args.ws_max_connections_per_ip, defaults.ws_max_connections_per_ip),
        ws_max_message_bytes: map_optional_default_on_zero(args.ws_max_message_bytes, defaults.ws_max_message_bytes),
        ws_send_timeout_ms: map_optional_default_on_zero(args.ws_send_timeout_ms, defaults.ws_send_timeout_ms),
        ws_heartbeat_interval_seconds: map_optional_default_on_zero(args.ws_heartbeat_interval_seconds, defaults.ws_heartbeat_interval_seconds),
        ws_heartbeat_grace_seconds: map_optional_default_on_zero(args.ws_heartbeat_grace_seconds, defaults.ws_heartbeat_grace_seconds),
        fanout_redis_url: args.fanout_redis_url.clone(),
        fanout_channel: args.fanout_channel.clone().or_else(|| defaults.fanout_channel.clone()),
        fanout_origin: args.fanout_origin.clone(),
        fanout_publish: args.fanout_publish.or(defaults.fanout_publish),
        fanout_subscribe: args.fanout_subscribe.or(defaults.fanout_subscribe),
    })
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Flag, then `env_token` (the `API_TOKEN` variable), then the token file.
fn resolve_api_token(args: &Args, env_token: Option<String>) -> Result<Option<String>> {
    if let Some(token) = args.api_token.clone().and_then(non_empty) {
        return Ok(Some(token));
    }
    if let Some(token) = env_token.and_then(non_empty) {
        return Ok(Some(token));
    }
    match &args.api_token_file {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read api token file {}", path.display()))?;
            Ok(non_empty(contents))
        }
        None => Ok(None),
    }
}

fn require_env(var: &str) -> Result<String> {
    let value = std::env::var(var).unwrap_or_default();
    if value.trim().is_empty() {
        anyhow::bail!("Missing required env: {var}");
    }
    Ok(value)
}

fn ensure_production_env(config: &ServerConfig) -> Result<()> {
    if !is_production() {
        return Ok(());
    }
    require_env("ALLOWED_HTTP_ORIGINS")?;
    require_env("METRICS_AUTH_TOKEN")?;
    if config.api_token.is_none() {
        anyhow::bail!("Missing required env: API_TOKEN");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse args
    let args = Args::parse();

    // Create logger
    init_tracing()?;

    let mut config = build_config(&args)?;
    config.api_token = resolve_api_token(&args, std::env::var("API_TOKEN").ok())?;
    ensure_production_env(&config)?;
    info!(
        provider = %config.provider_url(),
        race_types = ?config.race_types,
        "wagerboard config loaded"
    );

    let source = AffiliateClient::new(&config).context("failed to build provider client")?;
    let store = RaceStore::open(config.store_location(), config.store_timeout())
        .await
        .context("failed to open race store")?;
    let wagerboard = Arc::new(Wagerboard::new(config, Arc::new(source), store));
    wagerboard.start_fanout();

    let mut scheduler = Scheduler::new(Arc::clone(&wagerboard));
    scheduler.start();

    let api = Api::new(wagerboard);
    let app = api.router();

    // Start server
    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("axum server error")?;

    scheduler.shutdown().await;
    Ok(())
}

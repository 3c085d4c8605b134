#![forbid(unsafe_code)]

mod config;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chatline_domain::RoomId;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::auth::TokenService;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::hub::Hub;
use crate::server::message_store::{self, MessageStore};
use crate::server::presence::PresenceStore;
use crate::server::rest::{AppState, router};
use crate::server::room_registry::RoomRegistry;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chatline_server [--config <path>]\n\
\n\
Options:\n\
\t--config   Path to TOML config (default: ~/.chatline/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatline_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder().with_tonic().with_endpoint(endpoint.clone()).build() {
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder().with_batch_exporter(exporter).build();
				let tracer = tracer_provider.tracer("chatline_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

/// Installs the Prometheus recorder without binding its own listener: `/metrics` is served by the
/// main axum router rather than a second HTTP server (§4.10).
fn init_metrics() -> PrometheusHandle {
	PrometheusBuilder::new().install_recorder().expect("prometheus recorder installs exactly once per process")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let metrics_handle = init_metrics();

	let config_path = match parse_args() {
		Some(p) => p,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.health_bind.as_deref() {
		match chatline_util::bindaddr::parse(bind) {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address"),
		}
	}

	let presence = PresenceStore::connect(&server_cfg.redis.url, server_cfg.hub.presence_ttl).await?;
	let message_pool = message_store::connect(&server_cfg.persistence.database_url).await?;
	let message_store = MessageStore::new(message_pool.clone());
	let room_registry = RoomRegistry::new(message_pool);

	let (hub, hub_handle) = Hub::new(presence.clone(), room_registry.clone());
	tokio::spawn(hub.run());

	let token_service = Arc::new(TokenService::new(server_cfg.auth.jwt_secret.clone(), server_cfg.auth.token_ttl));

	let default_room = RoomId::new(server_cfg.default_room.clone())?;

	let state = AppState {
		hub: hub_handle,
		token_service,
		message_store,
		presence,
		room_registry,
		connection_settings: AppState::connection_settings_from(&server_cfg.hub),
		default_room,
		history_limit: server_cfg.persistence.history_limit,
		metrics_handle,
	};

	let app = router(state);

	let bind_addr: SocketAddr = chatline_util::bindaddr::parse(&server_cfg.bind).map_err(|e| anyhow::anyhow!(e))?;
	let listener = tokio::net::TcpListener::bind(bind_addr).await?;
	info!(%bind_addr, "chatline_server listening");

	health_state.mark_ready();

	axum::serve(listener, app).await?;

	Ok(())
}

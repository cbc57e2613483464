use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use clap::Parser;
use serde::Deserialize;
use sift_core::PlanOptions;
use sift_engine::{FieldType, InMemoryMappings, SearchEngine, SqliteStore};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "sift-hub", version, about = "SIFT search server")]
struct Args {
    /// Server bind address
    #[arg(long, default_value = "127.0.0.1:9200")]
    bind: String,

    /// Path to config file
    #[arg(long, default_value = "sift-hub.toml")]
    config: PathBuf,

    /// Database file; overrides `storage.path`. `:memory:` keeps everything in RAM.
    #[arg(long)]
    database: Option<PathBuf>,
}

// =============================================================================
// Config
// =============================================================================

#[derive(Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub search: SearchConfig,
    /// `[mappings.<index>]` tables of `field = "type"`.
    #[serde(default)]
    pub mappings: HashMap<String, HashMap<String, FieldType>>,
}

#[derive(Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            max_body_bytes: default_max_body(),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_size")]
    pub default_size: i64,
    #[serde(default)]
    pub strict_sort: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_size: default_size(),
            strict_sort: false,
        }
    }
}

impl SearchConfig {
    fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            strict_sort: self.strict_sort,
            default_size: self.default_size,
        }
    }
}

fn default_request_timeout() -> u64 {
    30_000
}
fn default_max_body() -> usize {
    10 * 1024 * 1024
}
fn default_db_path() -> PathBuf {
    PathBuf::from("sift.db")
}
fn default_busy_timeout() -> u64 {
    5_000
}
fn default_size() -> i64 {
    10
}

fn load_config(path: &Path) -> Config {
    if !path.exists() {
        return Config::default();
    }
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("Failed to read config {:?}: {}; using defaults", path, e);
            return Config::default();
        }
    };
    match toml::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Invalid config {:?}: {}; using defaults", path, e);
            Config::default()
        }
    }
}

// =============================================================================
// Application State
// =============================================================================

pub struct AppState {
    pub engine: SearchEngine<SqliteStore>,
    pub mappings: Arc<InMemoryMappings>,
    pub config: Config,
}

impl AppState {
    pub fn new(store: SqliteStore, config: Config) -> Self {
        let mappings = Arc::new(InMemoryMappings::from_config(&config.mappings));
        let engine = SearchEngine::new(Arc::new(store), mappings.clone())
            .with_plan_options(config.search.plan_options());
        Self {
            engine,
            mappings,
            config,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.server.request_timeout_ms)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let max_body = state.config.server.max_body_bytes;
    Router::new()
        .route("/_search", get(api::search_all).post(api::search_all))
        .route("/:index/_search", get(api::search_index).post(api::search_index))
        .route(
            "/:index/:doc_type/_search",
            get(api::search_index_type).post(api::search_index_type),
        )
        .route(
            "/:index/_validate/query",
            get(api::validate_query).post(api::validate_query),
        )
        .route("/:index/_mapping", put(api::put_mapping).get(api::get_mapping))
        .route("/:index/:doc_type", post(api::create_document))
        .route("/:index/:doc_type/:id", put(api::put_document))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "sift_hub=info,sift_engine=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args.config);

    let db_path = args.database.clone().unwrap_or_else(|| config.storage.path.clone());
    let store = if db_path.as_os_str() == ":memory:" {
        SqliteStore::open_in_memory()?
    } else {
        SqliteStore::open(
            &db_path,
            Duration::from_millis(config.storage.busy_timeout_ms),
        )?
    };

    let seeded = config.mappings.len();
    let state = Arc::new(AppState::new(store, config));
    let app = router(state.clone());

    let addr: SocketAddr = args.bind.parse()?;
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("  SIFT v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Search:     http://{}/_search", addr);
    tracing::info!("  Database:   {:?}", db_path);
    tracing::info!("  Mappings:   {} index(es) seeded from config", seeded);
    tracing::info!("  Timeout:    {:?}", state.request_timeout());
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_sections_and_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            request_timeout_ms = 250

            [search]
            strict_sort = true

            [mappings.logs]
            ts = "date"
            bytes = "long"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.request_timeout_ms, 250);
        assert_eq!(config.server.max_body_bytes, default_max_body());
        assert_eq!(config.storage.path, PathBuf::from("sift.db"));
        assert!(config.search.strict_sort);
        assert_eq!(config.search.default_size, 10);
        assert_eq!(config.mappings["logs"]["ts"], FieldType::Date);
    }

    #[test]
    fn test_missing_config_file_gives_defaults() {
        let config = load_config(Path::new("/definitely/not/here.toml"));
        assert_eq!(config.server.request_timeout_ms, 30_000);
        assert!(config.mappings.is_empty());
    }
}

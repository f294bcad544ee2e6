use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use clap::Parser;
use tower_http::trace::TraceLayer;
use url::Url;

use dexie_offline::formats::OfflineStatus;
use dexie_offline::worker::cache_store::{CacheStorage, LocalFsCacheStorage};
use dexie_offline::worker::client::OfflineClient;
use dexie_offline::worker::fetcher::{Fetcher, HttpFetcher};
use dexie_offline::worker::model::{ClearCacheAck, FetchRequest};
use dexie_offline::worker::runner::{DEFAULT_CACHE_VERSION, ServiceWorker, ServiceWorkerConfig};
use dexie_offline::worker::status_store::StatusStore;

const CACHE_VERSION_ENV: &str = "DEXIE_OFFLINE_CACHE_VERSION";

#[derive(Debug, Parser)]
#[command(author, version, about = "Serve a site through the offline cache")]
struct AppArgs {
    #[arg(long, default_value = "127.0.0.1:4000")]
    addr: SocketAddr,

    /// Site origin to proxy, e.g. http://localhost:3000.
    #[arg(long)]
    origin: Url,

    #[arg(long, default_value = "workspace-offline")]
    cache_dir: PathBuf,

    /// Cache partition name. Falls back to $DEXIE_OFFLINE_CACHE_VERSION.
    #[arg(long)]
    cache_version: Option<String>,

    /// Seconds to wait for the origin before answering from the cache (0 disables).
    #[arg(long, default_value_t = 10)]
    fetch_timeout_secs: u64,

    #[arg(long, default_value_t = 4)]
    prefetch_concurrency: usize,
}

#[derive(Clone)]
struct AppState {
    worker: ServiceWorker,
    client: OfflineClient,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    dexie_offline::logging::init_with_default("info,tower_http=debug")?;

    let args = AppArgs::parse();
    tracing::info!(?args, "starting dexie-offline-proxy");

    let mut config = ServiceWorkerConfig::new(cache_version(args.cache_version.as_deref()));
    config.fetch_timeout = (args.fetch_timeout_secs > 0)
        .then(|| Duration::from_secs(args.fetch_timeout_secs));
    config.prefetch_concurrency = args.prefetch_concurrency;

    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(args.origin.clone())?);
    let caches: Arc<dyn CacheStorage> = Arc::new(LocalFsCacheStorage::new(&args.cache_dir));
    let status = Arc::new(
        StatusStore::open(&args.cache_dir)
            .await
            .context("open offline status")?,
    );

    let worker = ServiceWorker::new(config, fetcher, caches, status);
    worker.start().await.context("start service worker")?;
    let client = worker.client(Some(worker.listen(16)));

    let state = AppState { worker, client };
    let app = Router::new()
        .route("/__offline/status", get(status_handler))
        .route("/__offline/warm", post(warm_handler))
        .route("/__offline/clear", post(clear_handler))
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", args.addr))?;
    tracing::info!(addr = %args.addr, origin = %args.origin, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn cache_version(flag: Option<&str>) -> String {
    flag.map(str::to_owned)
        .or_else(|| std::env::var(CACHE_VERSION_ENV).ok())
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_CACHE_VERSION.to_owned())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(%err, "listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

async fn status_handler(State(state): State<AppState>) -> Json<Option<OfflineStatus>> {
    Json(state.client.status())
}

async fn warm_handler(State(state): State<AppState>) -> StatusCode {
    state.client.trigger_cache_warming();
    StatusCode::ACCEPTED
}

async fn clear_handler(
    State(state): State<AppState>,
) -> Result<Json<ClearCacheAck>, (StatusCode, String)> {
    state
        .client
        .clear_offline_cache_acknowledged()
        .await
        .map(Json)
        .ok_or_else(|| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "worker did not acknowledge the clear request".to_string(),
            )
        })
}

async fn proxy_handler(State(state): State<AppState>, request: Request) -> Response {
    if request.method() != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    if path.starts_with("//") || path.starts_with("/\\") {
        return (StatusCode::BAD_REQUEST, "path must be origin-relative").into_response();
    }
    let accept = request
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok());

    let cached = state.worker.handle_fetch(FetchRequest::infer(path, accept)).await;

    let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut resp = Response::new(Body::from(cached.body));
    *resp.status_mut() = status;
    if let Some(content_type) = cached
        .content_type
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        resp.headers_mut().insert(header::CONTENT_TYPE, content_type);
    }
    resp
}

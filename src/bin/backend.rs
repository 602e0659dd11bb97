#![forbid(unsafe_code)]

//! Axum backend for the ranking site.
//!
//! Rankings are served out of the KV cache and rebuilt from nicovideo on a
//! miss. The admin and cron endpoints are guarded by shared secrets taken
//! from the environment, and anything outside `/api` is served from
//! `WWW_ROOT` with the SPA index as fallback.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Query, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::Utc;
use clap::Parser;
use mime_guess::MimeGuess;
use nicorank_tools::{
    client_state::{RankingConfig, RestorePlan, SavedState, UserPreferences, reconcile},
    config::{RuntimeOverrides, RuntimeSettings, Tuning, resolve_runtime_settings},
    kv,
    logging,
    ng::{ManualNgList, NgList},
    pipeline::{RankingPage, RankingService},
    ranking::{MAX_TAG_LEN, QueryError, RankingQuery},
    refresh::{CacheStatusReport, RefreshReport, cache_status, refresh_all},
    security::{bearer_token, ensure_not_root, secrets_match},
    stats::{StatsResponse, parse_ids},
    throttle::SlidingWindow,
    upstream::{NicoClient, Upstream},
};
use serde::{Deserialize, Serialize};
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;

const RATE_LIMIT_PER_MINUTE: usize = 120;
const RATE_LIMIT_PRUNE_EVERY: Duration = Duration::from_secs(300);
const RANKING_CACHE_CONTROL: &str = "public, s-maxage=30, stale-while-revalidate=60";

const X_CACHE_STATUS: HeaderName = HeaderName::from_static("x-cache-status");
const X_CACHE_TTL: HeaderName = HeaderName::from_static("x-cache-ttl");
const X_TOTAL_ITEMS: HeaderName = HeaderName::from_static("x-total-items");
const X_ADMIN_KEY: &str = "x-admin-key";

#[derive(Debug, Parser)]
#[command(name = "backend", about = "Serve cached nicovideo rankings over HTTP")]
struct BackendArgs {
    /// Directory for the local KV database.
    #[arg(long)]
    data_root: Option<PathBuf>,
    /// Built frontend to serve outside /api.
    #[arg(long)]
    www_root: Option<PathBuf>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    host: Option<String>,
    /// Tuning file; defaults to NICORANK_SETTINGS or ranking.toml.
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            data_root: self.data_root.clone(),
            www_root: self.www_root.clone(),
            nicorank_port: self.port,
            nicorank_host: self.host.clone(),
            env_path: self.env_file.clone(),
        }
    }
}

/// Shared state injected into every handler.
#[derive(Clone)]
struct AppState {
    service: RankingService,
    www_root: Option<Arc<PathBuf>>,
    admin_key: Option<Arc<str>>,
    cron_secret: Option<Arc<str>>,
    limiter: Arc<SlidingWindow>,
}

impl AppState {
    fn new(service: RankingService, settings: &RuntimeSettings) -> Self {
        Self {
            service,
            www_root: settings.www_root.clone().map(Arc::new),
            admin_key: settings.admin_key.as_deref().map(Arc::from),
            cron_secret: settings.cron_secret.as_deref().map(Arc::from),
            limiter: Arc::new(SlidingWindow::per_minute(RATE_LIMIT_PER_MINUTE)),
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Logs the full chain and hides it from the client.
    fn upstream(context: &str, err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{err:#}"), "{context}");
        Self::new(StatusCode::BAD_GATEWAY, context)
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init()?;
    ensure_not_root("backend")?;

    let args = BackendArgs::parse();
    let settings = resolve_runtime_settings(args.overrides())?;
    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(|| settings.settings_path.clone());
    let tuning = Tuning::load(&settings_path)?;

    let kv = kv::open(&settings.kv, &settings.data_root, tuning.ttl.stale_grace())
        .await
        .context("opening kv store")?;
    let upstream: Arc<dyn Upstream> = Arc::new(NicoClient::new(&tuning.upstream));
    let service = RankingService::new(kv, upstream, tuning);

    let host: IpAddr = settings
        .nicorank_host
        .parse()
        .with_context(|| format!("invalid listen host {:?}", settings.nicorank_host))?;
    let addr = SocketAddr::new(host, settings.nicorank_port);

    let state = AppState::new(service, &settings);
    if state.www_root.is_none() {
        tracing::warn!("WWW_ROOT not set; only /api routes are served");
    }
    if state.admin_key.is_none() {
        tracing::warn!("ADMIN_KEY not set; admin endpoints will answer 500");
    }
    spawn_limiter_pruning(state.limiter.clone());

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(%addr, "ranking api listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/ranking", get(get_ranking))
        .route("/api/ranking/restore", post(restore_ranking))
        .route("/api/video-stats", get(get_video_stats))
        .route("/api/status", get(get_status))
        .route("/api/admin/ng-list", get(get_ng_list).put(put_ng_list))
        .route("/api/admin/ng-list/derived", delete(clear_derived_ng))
        .route("/api/cron/fetch", post(cron_fetch))
        .fallback(static_fallback)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install Ctrl+C handler");
    }
    tracing::info!("shutting down");
}

fn spawn_limiter_pruning(limiter: Arc<SlidingWindow>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RATE_LIMIT_PRUNE_EVERY);
        loop {
            ticker.tick().await;
            limiter.prune(Instant::now());
        }
    });
}

/// Client identity for rate limiting: the first forwarded address when a
/// proxy sits in front, else the peer address.
fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    match forwarded.or(real_ip) {
        Some(value) => value.to_string(),
        None => peer
            .map(|peer| peer.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

fn too_many_requests(retry_after: Duration) -> Response {
    let mut response =
        ApiError::new(StatusCode::TOO_MANY_REQUESTS, "too many requests").into_response();
    let secs = retry_after.as_secs().max(1);
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    response
}

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !is_api_path(request.uri().path()) {
        return next.run(request).await;
    }
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let key = client_key(request.headers(), peer);
    match state.limiter.try_acquire(&key, Instant::now()) {
        Ok(_) => next.run(request).await,
        Err(retry_after) => {
            tracing::warn!(client = %key, path = %request.uri().path(), "rate limited");
            too_many_requests(retry_after)
        }
    }
}

fn is_api_path(path: &str) -> bool {
    path == "/api" || path.starts_with("/api/")
}

#[derive(Debug, Default, Deserialize)]
struct RankingParams {
    genre: Option<String>,
    period: Option<String>,
    tag: Option<String>,
    page: Option<String>,
}

/// Weak validator over what the client renders; cache bookkeeping fields
/// do not change it.
fn ranking_etag(page: &RankingPage) -> ApiResult<String> {
    let items = serde_json::to_vec(&page.items)
        .map_err(|err| ApiError::internal(format!("encoding ranking: {err}")))?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(&items);
    hasher.update(page.updated_at.to_rfc3339().as_bytes());
    hasher.update(&page.page.to_le_bytes());
    hasher.update(&(page.total_items as u64).to_le_bytes());
    let hex = hasher.finalize().to_hex();
    Ok(format!("W/\"{}\"", &hex[..32]))
}

fn etag_matches(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .any(|candidate| candidate == "*" || candidate == etag)
}

async fn get_ranking(
    State(state): State<AppState>,
    Query(params): Query<RankingParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let query = RankingQuery::parse(
        params.genre.as_deref(),
        params.period.as_deref(),
        params.tag.as_deref(),
        params.page.as_deref(),
    )?;
    let page = state
        .service
        .ranking(&query)
        .await
        .map_err(|err| ApiError::upstream("failed to load ranking", err))?;

    let etag = ranking_etag(&page)?;
    let etag_value = HeaderValue::from_str(&etag)
        .map_err(|err| ApiError::internal(format!("invalid etag: {err}")))?;

    let mut response = if etag_matches(&headers, &etag) {
        StatusCode::NOT_MODIFIED.into_response()
    } else {
        let mut response = Json(&page).into_response();
        let response_headers = response.headers_mut();
        response_headers.insert(X_TOTAL_ITEMS, HeaderValue::from(page.total_items));
        if let Some(ttl) = page.ttl {
            response_headers.insert(X_CACHE_TTL, HeaderValue::from(ttl));
        }
        response
    };
    let response_headers = response.headers_mut();
    response_headers.insert(header::ETAG, etag_value);
    response_headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(RANKING_CACHE_CONTROL),
    );
    response_headers.insert(
        X_CACHE_STATUS,
        HeaderValue::from_static(page.cache_status.as_str()),
    );
    Ok(response)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreRequest {
    config: RankingConfig,
    #[serde(default)]
    saved: Option<SavedState>,
    #[serde(default)]
    preferences: Option<UserPreferences>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RestoreResponse {
    #[serde(flatten)]
    plan: RestorePlan,
    storage_key: String,
    scroll_key: String,
    preferences: UserPreferences,
}

async fn restore_ranking(
    State(state): State<AppState>,
    Json(request): Json<RestoreRequest>,
) -> ApiResult<Json<RestoreResponse>> {
    let RestoreRequest {
        config,
        saved,
        preferences,
    } = request;
    if config
        .tag
        .as_deref()
        .is_some_and(|tag| tag.chars().count() > MAX_TAG_LEN)
    {
        return Err(QueryError::TagTooLong { max: MAX_TAG_LEN }.into());
    }

    let fresh = state
        .service
        .ranking(&config.first_page_query())
        .await
        .map_err(|err| ApiError::upstream("failed to load ranking", err))?;
    let page_size = state.service.tuning().pipeline.page_size;
    let plan = reconcile(
        &config,
        saved.as_ref(),
        &fresh,
        page_size,
        Utc::now().timestamp_millis(),
    );
    tracing::debug!(
        key = %config.storage_key(),
        restored = plan.restored,
        page = plan.current_page,
        "reconciled client state"
    );

    Ok(Json(RestoreResponse {
        storage_key: config.storage_key(),
        scroll_key: config.scroll_key(),
        plan,
        preferences: preferences.unwrap_or_default().sanitize(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct StatsParams {
    ids: Option<String>,
}

async fn get_video_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> ApiResult<Json<StatsResponse>> {
    let ids = parse_ids(params.ids.as_deref().unwrap_or_default());
    if ids.is_empty() {
        return Err(ApiError::bad_request(
            "ids must contain at least one video id",
        ));
    }
    let upstream = state.service.upstream();
    let stats = tokio::task::spawn_blocking(move || upstream.video_stats(&ids))
        .await
        .map_err(|err| ApiError::internal(format!("stats task failed: {err}")))?;
    Ok(Json(StatsResponse::new(stats, Utc::now())))
}

async fn get_status(State(state): State<AppState>) -> ApiResult<Json<CacheStatusReport>> {
    cache_status(&state.service)
        .await
        .map(Json)
        .map_err(|err| ApiError::internal(format!("{err:#}")))
}

#[derive(Debug, Default, Deserialize)]
struct AdminParams {
    key: Option<String>,
}

fn require_admin(state: &AppState, headers: &HeaderMap, params: &AdminParams) -> ApiResult<()> {
    let Some(expected) = state.admin_key.as_deref() else {
        return Err(ApiError::internal("ADMIN_KEY is not configured"));
    };
    let provided = headers
        .get(X_ADMIN_KEY)
        .and_then(|value| value.to_str().ok())
        .or(params.key.as_deref())
        .unwrap_or_default();
    if secrets_match(provided, expected) {
        Ok(())
    } else {
        Err(ApiError::unauthorized())
    }
}

async fn get_ng_list(
    State(state): State<AppState>,
    Query(params): Query<AdminParams>,
    headers: HeaderMap,
) -> ApiResult<Json<NgList>> {
    require_admin(&state, &headers, &params)?;
    Ok(Json(state.service.ng().load().await.as_ref().clone()))
}

async fn put_ng_list(
    State(state): State<AppState>,
    Query(params): Query<AdminParams>,
    headers: HeaderMap,
    Json(manual): Json<ManualNgList>,
) -> ApiResult<Json<NgList>> {
    require_admin(&state, &headers, &params)?;
    state
        .service
        .ng()
        .save_manual(&manual)
        .await
        .map_err(|err| ApiError::internal(format!("{err:#}")))?;
    Ok(Json(state.service.ng().load().await.as_ref().clone()))
}

async fn clear_derived_ng(
    State(state): State<AppState>,
    Query(params): Query<AdminParams>,
    headers: HeaderMap,
) -> ApiResult<Json<NgList>> {
    require_admin(&state, &headers, &params)?;
    state
        .service
        .ng()
        .clear_derived()
        .await
        .map_err(|err| ApiError::internal(format!("{err:#}")))?;
    tracing::info!("cleared derived ng list");
    Ok(Json(state.service.ng().load().await.as_ref().clone()))
}

async fn cron_fetch(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<RefreshReport>> {
    let Some(expected) = state.cron_secret.as_deref() else {
        return Err(ApiError::internal("CRON_SECRET is not configured"));
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .unwrap_or_default();
    if !secrets_match(provided, expected) {
        return Err(ApiError::unauthorized());
    }
    Ok(Json(refresh_all(&state.service).await))
}

async fn static_fallback(State(state): State<AppState>, uri: Uri) -> Response {
    let path = uri.path();
    if is_api_path(path) {
        return ApiError::not_found("endpoint not found").into_response();
    }
    let Some(root) = state.www_root.as_deref() else {
        return ApiError::not_found("not found").into_response();
    };
    match serve_static(root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

/// Serves a file below `root`. Extensionless paths that do not exist are
/// client-side routes and get `index.html`.
async fn serve_static(root: &Path, request_path: &str) -> ApiResult<Response> {
    let index = root.join("index.html");
    let Some(target) = static_target(root, request_path) else {
        return Err(ApiError::not_found("file not found"));
    };
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_file() => stream_file(&target).await,
        Ok(_) => stream_file(&index).await,
        Err(_) if is_client_route(request_path) => stream_file(&index).await,
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

fn static_target(root: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = Path::new(request_path.trim_start_matches('/'));
    if relative.as_os_str().is_empty() {
        return Some(root.join("index.html"));
    }
    relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
        .then(|| root.join(relative))
}

fn is_client_route(request_path: &str) -> bool {
    Path::new(request_path.trim_start_matches('/'))
        .extension()
        .is_none()
}

async fn stream_file(path: &Path) -> ApiResult<Response> {
    let file = File::open(path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Some(mime) = MimeGuess::from_path(path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

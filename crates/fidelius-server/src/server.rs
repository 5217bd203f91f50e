use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    cleanup::{CleanupConfig, CleanupScheduler},
    handlers::{create_secret, get_secret, health},
    rate_limit::{RateLimiter, IDLE_EVICTION_AFTER},
    store::{PayloadLimits, Store},
    AppState,
};

const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// Days a secret is kept when nobody reads it ($FIDELIUS_KEEP_MAX_DAYS).
    pub keep_max_days: u64,
    /// Longest plaintext, in characters, a client may encrypt ($FIDELIUS_SECRET_MAX_CHARS).
    pub secret_max_chars: usize,
    /// Create + fetch requests per client per minute ($FIDELIUS_RATE_LIMIT_PER_MINUTE).
    pub rate_limit_per_minute: u32,
    /// Time between expiry sweeps ($FIDELIUS_CLEANUP_INTERVAL_MINUTES).
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("FIDELIUS_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("FIDELIUS_PORT").unwrap_or(8080),
            data_dir: std::env::var("FIDELIUS_DATA_DIR").ok().map(PathBuf::from),
            keep_max_days: env_parse("FIDELIUS_KEEP_MAX_DAYS").unwrap_or(30),
            secret_max_chars: env_parse("FIDELIUS_SECRET_MAX_CHARS").unwrap_or(5000),
            rate_limit_per_minute: env_parse("FIDELIUS_RATE_LIMIT_PER_MINUTE").unwrap_or(10),
            cleanup_interval: Duration::from_secs(
                env_parse::<u64>("FIDELIUS_CLEANUP_INTERVAL_MINUTES").unwrap_or(60) * 60,
            ),
        }
    }
}

impl ServerConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.keep_max_days == 0 {
            anyhow::bail!("FIDELIUS_KEEP_MAX_DAYS must be at least 1");
        }
        if self.secret_max_chars == 0 {
            anyhow::bail!("FIDELIUS_SECRET_MAX_CHARS must be at least 1");
        }
        if PayloadLimits::checked_for_plaintext_chars(self.secret_max_chars).is_none() {
            anyhow::bail!("FIDELIUS_SECRET_MAX_CHARS is too large");
        }
        if self.cleanup_interval.is_zero() {
            anyhow::bail!("FIDELIUS_CLEANUP_INTERVAL_MINUTES must be at least 1");
        }
        if self.rate_limit_per_minute == 0 {
            warn!("FIDELIUS_RATE_LIMIT_PER_MINUTE is 0: every request will be rejected");
        }
        Ok(())
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.keep_max_days.saturating_mul(SECONDS_PER_DAY))
    }

    pub fn payload_limits(&self) -> PayloadLimits {
        PayloadLimits::for_plaintext_chars(self.secret_max_chars)
    }

    pub fn cleanup(&self) -> CleanupConfig {
        CleanupConfig {
            interval: self.cleanup_interval,
            ..CleanupConfig::default()
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Resolve the data directory, creating it if needed.
/// Public so the CLI sweep command can reuse this logic.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

/// Open `fidelius.db` inside `data_dir` with the limits from `cfg`.
pub fn open_store(data_dir: &Path, cfg: &ServerConfig) -> Result<Store> {
    let db_path = data_dir.join("fidelius.db");
    Store::open(&db_path, cfg.payload_limits())
        .with_context(|| format!("open store at {}", db_path.display()))
}

/// The public API. Security headers and static assets are left to the
/// reverse proxy in front of it.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/create", post(create_secret))
        .route("/api/v1/secrets/{id}", get(get_secret))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    cfg.validate()?;

    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let store = open_store(&data_dir, &cfg)?;
    let limiter = Arc::new(RateLimiter::new(cfg.rate_limit_per_minute));

    info!(
        interval_mins = cfg.cleanup_interval.as_secs() / 60,
        "starting background cleanup of expired secrets"
    );
    let secret_sweeper = CleanupScheduler::spawn(store.clone(), cfg.cleanup());
    let bucket_sweeper = CleanupScheduler::spawn(
        limiter.clone(),
        CleanupConfig {
            startup_delay: IDLE_EVICTION_AFTER,
            interval: IDLE_EVICTION_AFTER,
        },
    );

    let state = AppState {
        store,
        limiter,
        retention: cfg.retention(),
    };
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(
        %addr,
        keep_max_days = cfg.keep_max_days,
        secret_max_chars = cfg.secret_max_chars,
        rate_limit_per_minute = cfg.rate_limit_per_minute,
        "fidelius server listening"
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error");

    secret_sweeper.shutdown().await;
    bucket_sweeper.shutdown().await;
    served
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => {
            warn!(error = %e, "cannot listen for ctrl-c; running until killed");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        extract::connect_info::MockConnectInfo,
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    struct TestApp {
        router: Router,
        store: Store,
        _dir: tempfile::TempDir,
    }

    fn test_app(per_minute: u32) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(
            &dir.path().join("api.db"),
            PayloadLimits::for_plaintext_chars(10),
        )
        .unwrap();
        let state = AppState {
            store: store.clone(),
            limiter: Arc::new(RateLimiter::new(per_minute)),
            retention: Duration::from_secs(SECONDS_PER_DAY),
        };
        let router = router(state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));
        TestApp {
            router,
            store,
            _dir: dir,
        }
    }

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn create(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/create")
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    fn fetch(id: &str) -> Request<Body> {
        Request::builder()
            .uri(format!("/api/v1/secrets/{id}"))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn health_ok() {
        let app = test_app(10);
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn create_then_fetch_once() {
        let app = test_app(10);
        let (status, body) =
            send(&app, create(r#"{"ciphertext":"AAA","nonce":"BBB"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        let id = body["id"].as_str().unwrap().to_owned();

        let (status, body) = send(&app, fetch(&id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"ciphertext": "AAA", "nonce": "BBB"}));

        let (status, body) = send(&app, fetch(&id)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "not_found"}));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let app = test_app(10);
        let (status, body) = send(&app, fetch("0123456789abcdef0123456789abcdef")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn rejects_bad_payloads_without_storing() {
        let app = test_app(100);
        // 4 * ceil(68 / 3) + 128 = 220 for ten characters.
        let too_big = json!({"ciphertext": "A".repeat(221), "nonce": "n"}).to_string();

        let cases = [
            ("not json", "invalid_json"),
            (r#"{"ciphertext":"A"}"#, "invalid_json"),
            (r#"{"ciphertext":"","nonce":"n"}"#, "invalid_payload"),
            (r#"{"ciphertext":"A","nonce":"  "}"#, "invalid_payload"),
            (too_big.as_str(), "ciphertext_too_large"),
            (r#"{"ciphertext":"A","nonce":"n","ttl_seconds":0}"#, "invalid_ttl"),
            (r#"{"ciphertext":"A","nonce":"n","ttl_seconds":86401}"#, "invalid_ttl"),
        ];
        for (body, code) in cases {
            let (status, json) = send(&app, create(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
            assert_eq!(json["error"], code, "{body}");
        }
        assert!(app.store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn honours_client_ttl_within_retention() {
        let app = test_app(10);
        let (status, body) = send(
            &app,
            create(r#"{"ciphertext":"A","nonce":"n","ttl_seconds":3600}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["id"].is_string());
        assert_eq!(app.store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn rate_limit_applies_before_parsing() {
        let app = test_app(2);
        for _ in 0..2 {
            let (status, _) = send(&app, fetch("nope")).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
        }
        let (status, body) = send(&app, create("not json")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body, json!({"error": "rate_limit"}));
    }

    #[tokio::test]
    async fn forwarded_clients_have_separate_budgets() {
        let app = test_app(1);
        let from = |ip: &str| {
            Request::builder()
                .uri("/api/v1/secrets/nope")
                .header("x-forwarded-for", ip)
                .body(Body::empty())
                .unwrap()
        };
        assert_eq!(send(&app, from("203.0.113.1")).await.0, StatusCode::NOT_FOUND);
        assert_eq!(
            send(&app, from("203.0.113.1")).await.0,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(send(&app, from("203.0.113.2")).await.0, StatusCode::NOT_FOUND);
    }

    #[test]
    fn config_derivations() {
        let cfg = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            data_dir: None,
            keep_max_days: 2,
            secret_max_chars: 5000,
            rate_limit_per_minute: 10,
            cleanup_interval: Duration::from_secs(600),
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.retention(), Duration::from_secs(2 * 86_400));
        assert_eq!(cfg.payload_limits().max_ciphertext_len, 26_832);
        assert_eq!(cfg.cleanup().interval, Duration::from_secs(600));
        assert_eq!(cfg.cleanup().startup_delay, Duration::from_secs(5));

        let bad = ServerConfig {
            keep_max_days: 0,
            ..cfg.clone()
        };
        assert!(bad.validate().is_err());

        let huge = ServerConfig {
            secret_max_chars: usize::MAX / 2,
            ..cfg
        };
        assert!(huge.validate().is_err());
    }

    #[test]
    fn configured_data_dir_is_created_and_used() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        let resolved = resolve_data_dir(Some(&nested)).unwrap();
        assert_eq!(resolved, nested);
        assert!(nested.is_dir());
    }
}

use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sweep_db::Database;
use sweep_kernel::{
    AccessGuard, BucketStore, InboundRequest, MissingPendingPolicy, ReconcileOutcome, Reconciler,
    ReconcilerConfig, Rejection, RemovalInfo, SkipReason, StoreSettings, DEFAULT_BUCKET,
    DEFAULT_SECRET_HEADER,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::audit;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_ACCESS_KEY_ID: &str = "service_role";
const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.db_url)
        .await
        .context("failed to open audit database")?;
    if config.migrate {
        db.migrate()
            .await
            .context("failed to apply audit log migrations")?;
    }

    let store =
        BucketStore::from_settings(&config.store).context("failed to configure object store")?;

    let guard = AccessGuard::new(config.shared_secret.as_deref());
    if !guard.is_configured() {
        warn!("SHARED_SECRET is not configured; every request will be rejected");
    }

    let reconciler = Reconciler::new(
        guard,
        Arc::new(store),
        Arc::new(db.clone()),
        config.reconciler.clone(),
    );
    let state = Arc::new(AppState {
        reconciler,
        db,
        secret_header: config.secret_header.clone(),
    });

    let app = build_router(state)
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(
        addr = %config.listen_addr,
        bucket = %config.reconciler.bucket,
        "sweep-daemon listening"
    );
    axum::serve(listener, app)
        .await
        .context("HTTP server exited")?;
    Ok(())
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", any(reconcile))
        .route("/api/v1/reconcile", any(reconcile))
        .route("/healthz", get(healthz))
        .route("/api/v1/deletions", get(audit::list_deletions))
        .with_state(state)
}

pub(crate) struct AppState {
    pub(crate) reconciler: Reconciler,
    pub(crate) db: Database,
    pub(crate) secret_header: HeaderName,
}

impl AppState {
    pub(crate) fn credential<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get(&self.secret_header)
            .and_then(|value| value.to_str().ok())
    }
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    db_url: String,
    migrate: bool,
    store: StoreSettings,
    shared_secret: Option<String>,
    secret_header: HeaderName,
    reconciler: ReconcilerConfig,
    request_timeout: Duration,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let listen_addr = var("SWEEP_API_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse()
            .context("invalid SWEEP_API_ADDR")?;

        let db_url = var("SWEEP_DB_DSN")
            .or_else(|| var("DATABASE_URL"))
            .context("SWEEP_DB_DSN or DATABASE_URL must be configured")?;

        let migrate = var("SWEEP_DB_MIGRATE")
            .and_then(|value| parse_bool(&value))
            .unwrap_or(false);

        let bucket = var("OBJECT_STORE_BUCKET").unwrap_or_else(|| DEFAULT_BUCKET.to_string());
        let store = StoreSettings {
            endpoint: var("OBJECT_STORE_ENDPOINT")
                .context("OBJECT_STORE_ENDPOINT must be configured")?,
            bucket: bucket.clone(),
            access_key_id: var("OBJECT_STORE_ACCESS_KEY_ID")
                .unwrap_or_else(|| DEFAULT_ACCESS_KEY_ID.to_string()),
            secret_access_key: var("OBJECT_STORE_ADMIN_CREDENTIAL"),
            region: var("OBJECT_STORE_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string()),
        };

        // The secret is compared byte for byte, so it is not trimmed.
        let shared_secret = lookup("SHARED_SECRET").filter(|value| !value.is_empty());

        let header = var("SHARED_SECRET_HEADER")
            .unwrap_or_else(|| DEFAULT_SECRET_HEADER.to_string())
            .to_ascii_lowercase();
        let secret_header =
            HeaderName::from_bytes(header.as_bytes()).context("invalid SHARED_SECRET_HEADER")?;

        let missing_pending: MissingPendingPolicy = match var("SWEEP_MISSING_PENDING") {
            Some(raw) => raw
                .parse()
                .map_err(anyhow::Error::msg)
                .context("invalid SWEEP_MISSING_PENDING")?,
            None => MissingPendingPolicy::default(),
        };

        let request_timeout = match var("SWEEP_REQUEST_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(
                raw.parse()
                    .with_context(|| format!("invalid SWEEP_REQUEST_TIMEOUT_SECS '{raw}'"))?,
            ),
            None => Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        };

        Ok(Self {
            listen_addr,
            db_url,
            migrate,
            store,
            shared_secret,
            secret_header,
            reconciler: ReconcilerConfig {
                bucket,
                missing_pending,
            },
            request_timeout,
        })
    }
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[utoipa::path(
    post,
    path = "/api/v1/reconcile",
    request_body = ChangeEventBody,
    responses(
        (status = 200, description = "Object removed, or nothing to do", body = MessageBody),
        (status = 400, description = "Deletion or payload processing failed", body = ErrorBody),
        (status = 401, description = "Missing or invalid shared secret", body = ErrorBody),
        (status = 405, description = "Method not allowed", body = ErrorBody)
    ),
    security(("sharedSecret" = []))
)]
async fn reconcile(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = InboundRequest {
        method: method.as_str(),
        credential: state.credential(&headers),
        body: &body,
    };

    match state.reconciler.handle(request).await {
        Ok(outcome) => outcome_response(outcome),
        Err(rejection) => ApiError::from(rejection).into_response(),
    }
}

fn outcome_response(outcome: ReconcileOutcome) -> Response {
    match outcome {
        ReconcileOutcome::Skipped(reason) => {
            let message = match reason {
                SkipReason::NoReference => "No image_url found, skipping".to_string(),
                SkipReason::EmptyKey => "No object key in image_url, skipping".to_string(),
                SkipReason::IgnoredKind(kind) => format!("Ignoring {kind} event"),
            };
            (StatusCode::OK, Json(MessageBody::new(message))).into_response()
        }
        ReconcileOutcome::Completed {
            removal, warning, ..
        } => {
            let body = MessageBody {
                message: "Deletion completed".to_string(),
                storage: Some(StorageBody::from(removal)),
                warning,
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        ReconcileOutcome::Failed { error, warning, .. } => {
            let body = ErrorBody {
                error: error.to_string(),
                warning,
            };
            (StatusCode::BAD_REQUEST, Json(body)).into_response()
        }
    }
}

/// Change event as delivered by the database trigger.
#[derive(Debug, Deserialize, ToSchema)]
#[allow(dead_code)]
struct ChangeEventBody {
    old_record: Option<PriorRecordBody>,
    /// `INSERT`, `UPDATE` or `DELETE`; only deletes remove objects.
    #[serde(rename = "type")]
    #[schema(example = "DELETE")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[allow(dead_code)]
struct PriorRecordBody {
    /// Bare file name, relative path or full URL of the stored object.
    #[schema(example = "jane_smith.png")]
    image_url: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
struct MessageBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    storage: Option<StorageBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

impl MessageBody {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            storage: None,
            warning: None,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct StorageBody {
    bucket: String,
    removed: Vec<String>,
}

impl From<RemovalInfo> for StorageBody {
    fn from(info: RemovalInfo) -> Self {
        Self {
            bucket: info.bucket,
            removed: info.removed,
        }
    }
}

#[derive(Debug)]
pub(crate) struct ApiError {
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

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub(crate) fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            // A missing secret is reported like a bad one so callers learn
            // nothing about the server configuration.
            Rejection::MisconfiguredServer | Rejection::Unauthorized => {
                ApiError::new(StatusCode::UNAUTHORIZED, "Unauthorized")
            }
            Rejection::MethodNotAllowed => {
                ApiError::new(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Rejections are already logged with their cause where they happen.
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, "api error");
        } else {
            debug!(status = %self.status, message = %self.message, "request rejected");
        }
        let body = Json(ErrorBody {
            error: self.message,
            warning: None,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub(crate) struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

pub mod docs {
    use super::*;
    use utoipa::{
        openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
        Modify, OpenApi,
    };

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Sweep Daemon API", version = "0.1.0"),
        paths(healthz, reconcile, audit::list_deletions),
        components(schemas(
            ChangeEventBody,
            PriorRecordBody,
            MessageBody,
            StorageBody,
            ErrorBody,
            audit::DeletionEntryResponse
        )),
        modifiers(&SecurityAddon)
    )]
    pub struct ApiDoc;

    struct SecurityAddon;

    impl Modify for SecurityAddon {
        fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
            openapi
                .components
                .get_or_insert_with(Default::default)
                .add_security_scheme(
                    "sharedSecret",
                    SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(
                        DEFAULT_SECRET_HEADER,
                    ))),
                );
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

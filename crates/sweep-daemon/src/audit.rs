use std::{str::FromStr, sync::Arc};

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use sweep_db::{AuditLogEntry, AuditLogFilter, DeletionStatus};
use utoipa::{IntoParams, ToSchema};

use crate::server::{ApiError, AppState, ErrorBody};

#[derive(Debug, Serialize, ToSchema)]
pub struct DeletionEntryResponse {
    pub id: i64,
    pub file_path: String,
    #[schema(example = "failed")]
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListDeletionsQuery {
    #[param(example = "pending")]
    pub status: Option<String>,
    #[param(example = "jane_smith.png")]
    pub file_path: Option<String>,
    /// Defaults to 100, capped at 500.
    #[param(example = 50)]
    pub limit: Option<u32>,
}

/// Lists audit entries newest first, e.g. `?status=failed` to find objects
/// that are still in the bucket after their row was deleted.
#[utoipa::path(
    get,
    path = "/api/v1/deletions",
    params(ListDeletionsQuery),
    responses(
        (status = 200, description = "List deletion attempts", body = [DeletionEntryResponse]),
        (status = 400, description = "Invalid query parameters", body = ErrorBody),
        (status = 401, description = "Missing or invalid shared secret", body = ErrorBody)
    ),
    security(("sharedSecret" = []))
)]
pub(crate) async fn list_deletions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ListDeletionsQuery>,
) -> Result<Json<Vec<DeletionEntryResponse>>, ApiError> {
    state
        .reconciler
        .guard()
        .authenticate(state.credential(&headers))
        .map_err(ApiError::from)?;

    let status = params
        .status
        .as_deref()
        .map(DeletionStatus::from_str)
        .transpose()
        .map_err(ApiError::bad_request)?;

    let filter = AuditLogFilter {
        status,
        file_path: params.file_path.as_deref(),
        limit: params.limit,
    };

    let entries = state
        .db
        .list(filter)
        .await
        .map_err(ApiError::internal)?
        .into_iter()
        .map(DeletionEntryResponse::from)
        .collect();

    Ok(Json(entries))
}

impl From<AuditLogEntry> for DeletionEntryResponse {
    fn from(entry: AuditLogEntry) -> Self {
        Self {
            id: entry.id,
            file_path: entry.file_path,
            status: entry.status.as_str().to_string(),
            error_message: entry.error_message,
            created_at: entry.created_at.to_rfc3339(),
            updated_at: entry.updated_at.to_rfc3339(),
        }
    }
}

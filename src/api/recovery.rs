use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;

use super::{tagged, AppState};
use crate::error::AppError;
use crate::services::TicketSummary;

#[derive(Debug, Deserialize)]
pub struct RecoverParams {
    pub token: Option<String>,
}

/// GET /recover?token=
pub async fn recover(
    State(state): State<AppState>,
    Query(params): Query<RecoverParams>,
    headers: HeaderMap,
) -> Result<Json<TicketSummary>, AppError> {
    state
        .recovery
        .resolve(params.token.as_deref())
        .await
        .map(Json)
        .map_err(AppError::from)
        .map_err(tagged(&headers))
}

use crate::dtos::{MissingPaymentsParams, ReportParams, SummaryParams};
use super::tally;
use crate::middleware::OwnerContext;
use crate::startup::AppState;
use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use service_core::error::AppError;
use tracing::instrument;

#[instrument(skip(state, owner), fields(owner_id = %owner.id()))]
pub async fn summary(
    State(state): State<AppState>,
    owner: OwnerContext,
    Query(params): Query<SummaryParams>,
) -> Result<impl IntoResponse, AppError> {
    let as_of = params.as_of.unwrap_or_else(|| Utc::now().date_naive());
    let summary = state
        .reporting
        .summary(owner.id(), params.period_days, as_of)
        .await
        .map_err(tally)?;
    Ok(Json(summary))
}

#[instrument(skip(state, owner), fields(owner_id = %owner.id()))]
pub async fn missing_payments(
    State(state): State<AppState>,
    owner: OwnerContext,
    Query(params): Query<MissingPaymentsParams>,
) -> Result<impl IntoResponse, AppError> {
    let as_of = params.as_of.unwrap_or_else(|| Utc::now().date_naive());
    let report = state
        .reporting
        .missing_payments(owner.id(), params.days_overdue, as_of)
        .await
        .map_err(tally)?;
    Ok(Json(report))
}

#[instrument(skip(state, owner), fields(owner_id = %owner.id()))]
pub async fn period_report(
    State(state): State<AppState>,
    owner: OwnerContext,
    Query(params): Query<ReportParams>,
) -> Result<impl IntoResponse, AppError> {
    let report = state
        .reporting
        .period_report(
            owner.id(),
            params.start_date,
            params.end_date,
            params.bank_account_id,
        )
        .await
        .map_err(tally)?;
    Ok(Json(report))
}

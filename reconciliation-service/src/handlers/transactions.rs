use crate::dtos::{
    ImportRequest, ManualMatchRequest, TransactionListParams, TransactionListResponse,
    WriteOffRequest,
};
use crate::middleware::OwnerContext;
use super::tally;
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

#[instrument(skip(state, owner, req), fields(owner_id = %owner.id()))]
pub async fn import_transactions(
    State(state): State<AppState>,
    owner: OwnerContext,
    Json(req): Json<ImportRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let result = state
        .engine
        .import(owner.id(), req.into())
        .await
        .map_err(tally)?;
    Ok(Json(result))
}

#[instrument(skip(state, owner, params), fields(owner_id = %owner.id()))]
pub async fn list_transactions(
    State(state): State<AppState>,
    owner: OwnerContext,
    Query(params): Query<TransactionListParams>,
) -> Result<impl IntoResponse, AppError> {
    let page = params.page();
    let (transactions, total) = state
        .engine
        .list_transactions(owner.id(), &params.filter(), page)
        .await
        .map_err(tally)?;
    Ok(Json(TransactionListResponse::new(transactions, total, page)))
}

#[instrument(skip(state, owner), fields(owner_id = %owner.id()))]
pub async fn get_transaction(
    State(state): State<AppState>,
    owner: OwnerContext,
    Path(transaction_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let detail = state
        .engine
        .transaction_detail(owner.id(), transaction_id)
        .await
        .map_err(tally)?;
    Ok(Json(detail))
}

#[instrument(skip(state, owner, req), fields(owner_id = %owner.id()))]
pub async fn manual_match(
    State(state): State<AppState>,
    owner: OwnerContext,
    Json(req): Json<ManualMatchRequest>,
) -> Result<impl IntoResponse, AppError> {
    let txn = state
        .engine
        .manual_match(owner.id(), req.transaction_id, req.payment_id)
        .await
        .map_err(tally)?;
    Ok(Json(txn))
}

#[instrument(skip(state, owner), fields(owner_id = %owner.id()))]
pub async fn unmatch(
    State(state): State<AppState>,
    owner: OwnerContext,
    Path(transaction_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let txn = state
        .engine
        .unmatch(owner.id(), transaction_id)
        .await
        .map_err(tally)?;
    Ok(Json(txn))
}

#[instrument(skip(state, owner, req), fields(owner_id = %owner.id()))]
pub async fn write_off(
    State(state): State<AppState>,
    owner: OwnerContext,
    Json(req): Json<WriteOffRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let txn = state
        .engine
        .write_off(owner.id(), req.transaction_id, &req.reason)
        .await
        .map_err(tally)?;
    Ok(Json(txn))
}

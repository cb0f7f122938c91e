use crate::dtos::RuleRequest;
use super::tally;
use crate::middleware::OwnerContext;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

#[instrument(skip(state, owner, req), fields(owner_id = %owner.id()))]
pub async fn create_rule(
    State(state): State<AppState>,
    owner: OwnerContext,
    Json(req): Json<RuleRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let rule = state.rules.create(owner.id(), req.into()).await.map_err(tally)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

#[instrument(skip(state, owner), fields(owner_id = %owner.id()))]
pub async fn list_rules(
    State(state): State<AppState>,
    owner: OwnerContext,
) -> Result<impl IntoResponse, AppError> {
    let rules = state.rules.list(owner.id()).await.map_err(tally)?;
    Ok(Json(rules))
}

#[instrument(skip(state, owner), fields(owner_id = %owner.id()))]
pub async fn get_rule(
    State(state): State<AppState>,
    owner: OwnerContext,
    Path(rule_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let rule = state.rules.get(owner.id(), rule_id).await.map_err(tally)?;
    Ok(Json(rule))
}

#[instrument(skip(state, owner, req), fields(owner_id = %owner.id()))]
pub async fn update_rule(
    State(state): State<AppState>,
    owner: OwnerContext,
    Path(rule_id): Path<Uuid>,
    Json(req): Json<RuleRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let rule = state.rules.update(owner.id(), rule_id, req.into()).await.map_err(tally)?;
    Ok(Json(rule))
}

#[instrument(skip(state, owner), fields(owner_id = %owner.id()))]
pub async fn delete_rule(
    State(state): State<AppState>,
    owner: OwnerContext,
    Path(rule_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.rules.delete(owner.id(), rule_id).await.map_err(tally)?;
    Ok(StatusCode::NO_CONTENT)
}

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated caller, as asserted by the upstream gateway.
///
/// Every transaction, rule and payment lookup is scoped to this id; records
/// of other owners are reported as not found.
#[derive(Debug, Clone)]
pub struct OwnerContext(pub String);

impl OwnerContext {
    pub fn id(&self) -> &str {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for OwnerContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let owner_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!("Missing {} header", USER_ID_HEADER))
            })?;

        tracing::Span::current().record("owner_id", owner_id);

        Ok(OwnerContext(owner_id.to_string()))
    }
}

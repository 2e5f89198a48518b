use crate::auth::jwt::verify_token;
use crate::error::AppError;
use crate::models::User;
use crate::AppState;
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use diesel::prelude::*;

/// Verifies the bearer token and attaches the `User` (and claims) to the
/// request.
pub async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    use crate::schema::users::dsl;

    let token = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)?;

    let claims = verify_token(token, &state.config.jwt.secret).map_err(|e| {
        tracing::debug!("Rejected token: {}", e);
        AppError::Unauthorized
    })?;

    let mut conn = state.db.get()?;
    let user = dsl::users
        .filter(dsl::id.eq(claims.user_id))
        .select(User::as_select())
        .first::<User>(&mut conn)
        .optional()?
        .ok_or_else(|| {
            tracing::warn!("Token for unknown user {}", claims.user_id);
            AppError::Unauthorized
        })?;
    drop(conn);

    request.extensions_mut().insert(claims);
    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}

pub fn require_admin(user: &User) -> Result<(), AppError> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

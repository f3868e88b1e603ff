//! `/auth/*` routes.

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite as CookieSameSite};
use serde::{Deserialize, Serialize};
use trenova_core::Pulid;

use crate::config::{CookieConfig, SameSite};
use crate::error::{AuthError, AuthResult};
use crate::middleware::{AuthState, Client, RequestContext, require_session};
use crate::service::{CheckEmailRequest, CheckEmailResponse, LoginRequest, LoginResponse};
use crate::session::Session;

pub fn router(state: AuthState) -> Router {
    let protected = Router::new()
        .route("/auth/logout", post(logout))
        .route("/auth/refresh", post(refresh))
        .route("/auth/sessions", get(list_sessions).delete(revoke_all_sessions))
        .route("/auth/switch-organization", post(switch_organization))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_session));

    Router::new()
        .route("/auth/check-email", post(check_email))
        .route("/auth/login", post(login))
        .merge(protected)
        .with_state(state)
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> AuthResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AuthError::validation("body", rejection.body_text()))
}

pub fn session_cookie(config: &CookieConfig, session_id: &Pulid) -> Cookie<'static> {
    let max_age = i64::try_from(config.max_age.as_secs()).unwrap_or(i64::MAX);
    let mut builder = Cookie::build((config.name.clone(), session_id.to_string()))
        .path(config.path.clone())
        .http_only(config.http_only)
        .secure(config.secure)
        .same_site(match config.same_site {
            SameSite::Strict => CookieSameSite::Strict,
            SameSite::Lax => CookieSameSite::Lax,
            SameSite::None => CookieSameSite::None,
        })
        .max_age(time::Duration::seconds(max_age));
    if let Some(domain) = &config.domain {
        builder = builder.domain(domain.clone());
    }
    builder.build()
}

fn removal_cookie(config: &CookieConfig) -> Cookie<'static> {
    Cookie::build(config.name.clone())
        .path(config.path.clone())
        .build()
}

async fn check_email(
    State(state): State<AuthState>,
    payload: Result<Json<CheckEmailRequest>, JsonRejection>,
) -> AuthResult<Json<CheckEmailResponse>> {
    let req = body(payload)?;
    Ok(Json(state.service.check_email(&req).await?))
}

async fn login(
    State(state): State<AuthState>,
    Client(client): Client,
    jar: CookieJar,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> AuthResult<(CookieJar, Json<LoginResponse>)> {
    let req = body(payload)?;
    let resp = state.service.login(&client, &req).await?;
    let jar = jar.add(session_cookie(&state.cookie, &resp.session_id));
    Ok((jar, Json(resp)))
}

async fn logout(
    State(state): State<AuthState>,
    Client(client): Client,
    ctx: RequestContext,
    jar: CookieJar,
) -> AuthResult<impl IntoResponse> {
    state.service.logout(&ctx.session_id, &client).await?;
    Ok((jar.remove(removal_cookie(&state.cookie)), StatusCode::NO_CONTENT))
}

async fn refresh(
    State(state): State<AuthState>,
    Client(client): Client,
    ctx: RequestContext,
) -> AuthResult<Json<Session>> {
    Ok(Json(state.service.refresh(&ctx.session_id, &client).await?))
}

async fn list_sessions(
    State(state): State<AuthState>,
    Client(client): Client,
    ctx: RequestContext,
) -> AuthResult<Json<Vec<Session>>> {
    Ok(Json(
        state.service.list_sessions(&ctx.session_id, &client).await?,
    ))
}

#[derive(Debug, Serialize)]
struct RevokedResponse {
    revoked: usize,
}

async fn revoke_all_sessions(
    State(state): State<AuthState>,
    Client(client): Client,
    ctx: RequestContext,
    jar: CookieJar,
) -> AuthResult<impl IntoResponse> {
    let revoked = state
        .service
        .revoke_all_sessions(&ctx.session_id, &client)
        .await?;
    Ok((
        jar.remove(removal_cookie(&state.cookie)),
        Json(RevokedResponse { revoked }),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwitchOrganizationRequest {
    organization_id: String,
}

async fn switch_organization(
    State(state): State<AuthState>,
    Client(client): Client,
    ctx: RequestContext,
    payload: Result<Json<SwitchOrganizationRequest>, JsonRejection>,
) -> AuthResult<Json<Session>> {
    let req = body(payload)?;
    let organization_id = Pulid::parse(&req.organization_id)
        .map_err(|e| AuthError::validation("organizationId", e.to_string()))?;
    Ok(Json(
        state
            .service
            .switch_organization(&ctx.session_id, &client, organization_id)
            .await?,
    ))
}

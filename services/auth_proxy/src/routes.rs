//! Session proxy routes

use axum::{
    Json, Router,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderValue, Method, header},
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    config::ProxySettings,
    cookies,
    error::ProxyError,
    models::{Lookup, ProxyRequest},
    session::SessionError,
    state::AppState,
    upstream::{UpstreamError, UpstreamResponse},
    validation::{safe_redirect, validate_upstream_path},
};

/// Create the router for the session proxy
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.settings);

    Router::new()
        .route("/health", get(health_check))
        .route("/sign_in", get(sign_in))
        .route("/callback", get(callback))
        .route("/sign_out", get(sign_out).post(sign_out))
        .route("/user_info", get(user_info))
        .route("/proxy", get(proxy_query).post(proxy_json))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(settings: &ProxySettings) -> CorsLayer {
    let origins: Vec<HeaderValue> = settings
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_healthy = state.sessions.health_check().await.unwrap_or(false);
    Json(json!({
        "status": "ok",
        "service": "auth-proxy",
        "session_store": store_healthy,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SignInQuery {
    pub redirect_to: Option<String>,
}

/// Start the login handshake, unless the cookie already holds a live session
pub async fn sign_in(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<SignInQuery>,
) -> Result<Response, ProxyError> {
    if let Some(session_id) = cookies::session_id(&jar, &state.settings) {
        if let Lookup::Current(_) = state.sessions.lookup(&session_id).await? {
            return Ok(Json(json!({"status": "already_authenticated"})).into_response());
        }
    }

    let redirect_to = safe_redirect(
        query.redirect_to.as_deref(),
        &state.settings.allowed_redirects,
        &state.settings.frontend_public_url,
    );
    let request = state.sessions.begin_login(redirect_to).await?;

    let jar = jar.add(cookies::login_state_cookie(&state.settings, &request.state));
    Ok((jar, Redirect::to(&request.url)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Identity provider redirect target: exchange the code and open a session
pub async fn callback(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let settings = &state.settings;
    let cookie_state = cookies::login_state(&jar);
    let jar = jar.add(cookies::clear_login_state_cookie());
    let fail = |jar: CookieJar, reason: &str| {
        let target = format!("{}?error={}", settings.frontend_public_url, reason);
        (jar, Redirect::to(&target)).into_response()
    };

    if let Some(error) = &query.error {
        warn!(error = %error, "Identity provider returned an error");
        return fail(jar, "provider_error");
    }

    let (Some(code), Some(login_state)) = (&query.code, &query.state) else {
        return fail(jar, "missing_parameters");
    };

    match state
        .sessions
        .complete_login(code, login_state, cookie_state.as_deref())
        .await
    {
        Ok((record, redirect_to)) => {
            let jar = jar.add(cookies::session_cookie(settings, &record.session_id));
            (jar, Redirect::to(&redirect_to)).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Login callback refused");
            fail(jar, e.reason())
        }
    }
}

/// Destroy the session and send the browser back to the login entry point
pub async fn sign_out(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<Response, ProxyError> {
    if let Some(session_id) = cookies::session_id(&jar, &state.settings) {
        state.sessions.sign_out(&session_id).await?;
    }
    let jar = jar.add(cookies::clear_session_cookie(&state.settings));
    Ok((jar, Redirect::to("/sign_in")).into_response())
}

/// Read-only identity projection; never rotates the session
pub async fn user_info(State(state): State<AppState>, jar: CookieJar) -> Response {
    let session_id = cookies::session_id(&jar, &state.settings);

    match state.sessions.user_info(session_id.as_deref()).await {
        Ok(info) if session_id.is_some() && !info.is_authorized => {
            let jar = jar.add(cookies::clear_session_cookie(&state.settings));
            (jar, Json(info)).into_response()
        }
        Ok(info) => Json(info).into_response(),
        Err(e) => session_failure(jar, &state.settings, e, false),
    }
}

/// `GET /proxy`: call described by query parameters
pub async fn proxy_query(
    State(state): State<AppState>,
    jar: CookieJar,
    request: Result<Query<ProxyRequest>, QueryRejection>,
) -> Response {
    match request {
        Ok(Query(request)) => proxy(state, jar, request).await,
        Err(rejection) => ProxyError::Validation(rejection.body_text()).into_response(),
    }
}

/// `POST /proxy`: call described by a JSON body
pub async fn proxy_json(
    State(state): State<AppState>,
    jar: CookieJar,
    request: Result<Json<ProxyRequest>, JsonRejection>,
) -> Response {
    match request {
        Ok(Json(request)) => proxy(state, jar, request).await,
        Err(rejection) => ProxyError::Validation(rejection.body_text()).into_response(),
    }
}

/// Rotate the session, then forward with the bearer token injected.
///
/// Once the rotation succeeded the old id is dead, so every later outcome
/// carries the new cookie unless the session itself was torn down.
async fn proxy(state: AppState, jar: CookieJar, request: ProxyRequest) -> Response {
    let settings = &state.settings;
    let redirect = request.redirect_to_sign_in;

    if let Some(path) = &request.path {
        if let Err(e) = validate_upstream_path(path) {
            return ProxyError::Validation(e).into_response();
        }
    }

    let Some(presented) = cookies::session_id(&jar, settings) else {
        return ProxyError::AuthenticationRequired { redirect }.into_response();
    };

    let record = match state.sessions.authorize_and_rotate(&presented).await {
        Ok(record) => record,
        Err(e) => return session_failure(jar, settings, e, redirect),
    };
    let jar = jar.add(cookies::session_cookie(settings, &record.session_id));

    let (tokens, refreshed) = match state.sessions.usable_tokens(&record).await {
        Ok(usable) => usable,
        Err(e) => return session_failure(jar, settings, e, redirect),
    };

    let mut upstream = match state.upstreams.forward(&request, &tokens.access_token).await {
        Ok(upstream) => upstream,
        Err(e) => return (jar, upstream_failure(e)).into_response(),
    };

    if upstream.status == axum::http::StatusCode::UNAUTHORIZED && !refreshed {
        info!(subject = %record.subject_id, upstream = %request.upstream_id, "Upstream rejected token, refreshing once");
        let tokens = match state.sessions.refresh_tokens(&record).await {
            Ok(tokens) => tokens,
            Err(e) => return session_failure(jar, settings, e, redirect),
        };
        upstream = match state.upstreams.forward(&request, &tokens.access_token).await {
            Ok(upstream) => upstream,
            Err(e) => return (jar, upstream_failure(e)).into_response(),
        };
    }

    (jar, passthrough(upstream)).into_response()
}

/// Error response for a session failure; a dead session also loses its cookie.
fn session_failure(
    jar: CookieJar,
    settings: &ProxySettings,
    error: SessionError,
    redirect: bool,
) -> Response {
    let ends_session = matches!(
        error,
        SessionError::Unauthenticated | SessionError::Anomaly | SessionError::RefreshFailed
    );
    let error = ProxyError::from_session(error, redirect);
    if ends_session {
        let jar = jar.add(cookies::clear_session_cookie(settings));
        (jar, error).into_response()
    } else {
        (jar, error).into_response()
    }
}

fn upstream_failure(error: UpstreamError) -> ProxyError {
    match error {
        UpstreamError::InvalidPath(msg) => ProxyError::Validation(msg),
        UpstreamError::NotConfigured(upstream) => {
            ProxyError::UpstreamUnavailable(format!("Upstream {} is not configured", upstream))
        }
        UpstreamError::Unreachable(_) => {
            ProxyError::UpstreamUnavailable("Upstream service unavailable".to_string())
        }
    }
}

fn passthrough(upstream: UpstreamResponse) -> Response {
    let mut response = (upstream.status, upstream.body).into_response();
    match upstream.content_type {
        Some(content_type) => {
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, content_type);
        }
        None => {
            response.headers_mut().remove(header::CONTENT_TYPE);
        }
    }
    response
}

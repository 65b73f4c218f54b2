//! Report service routes

use axum::{
    Extension, Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{HeaderValue, Method, header},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    access::authorize,
    error::{ApiError, ApiResult},
    middleware::{AuthUser, auth_middleware},
    models::{ReportRequest, ReportResponse},
    state::AppState,
    validation::{validate_period, validate_user_uuid},
};

/// Create the router for the report service
pub fn create_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/reports", post(create_report))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let origins: Vec<HeaderValue> = state
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn root() -> impl IntoResponse {
    Json(json!({ "service": "reports" }))
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "reports",
        "aggregate_source": state.reports.health_check().await,
    }))
}

/// Report for the caller, or for `user_uuid` when the caller is an administrator
pub async fn create_report(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    payload: Result<Json<ReportRequest>, JsonRejection>,
) -> ApiResult<Json<ReportResponse>> {
    let Json(request) = payload.map_err(|rejection| ApiError::Validation(rejection.body_text()))?;

    let requested = request.user_uuid.as_deref().filter(|uuid| !uuid.is_empty());
    if let Some(uuid) = requested {
        validate_user_uuid(uuid).map_err(ApiError::Validation)?;
    }
    let period = request.period();
    validate_period(&period).map_err(ApiError::Validation)?;

    let target = authorize(requested, &caller, &state.roles)?;
    validate_user_uuid(target).map_err(ApiError::Validation)?;

    info!(
        caller = %caller.subject_uuid,
        username = caller.username.as_deref().unwrap_or("-"),
        target = %target,
        schema = %request.schema,
        "Report requested"
    );

    let response = state
        .reports
        .get_or_build(request.schema, target, &period)
        .await?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::RolePolicy;
    use crate::cache::MemoryReportCache;
    use crate::models::Schema;
    use crate::repositories::{MemoryTelemetrySource, TelemetryEvent};
    use crate::service::{ReportService, RetryPolicy};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        response::Response,
    };
    use chrono::{TimeZone, Utc};
    use common::jwt::{AccessClaims, RealmAccess, TokenValidator, ValidatorConfig};
    use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, encode, get_current_timestamp};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const SECRET: &[u8] = b"realm-test-secret";
    const ISSUER: &str = "http://keycloak:8080/realms/reports-realm";
    const SUBJECT_A: &str = "54885c9b-6eea-48f7-89f9-353ad8273e95";
    const SUBJECT_C: &str = "7f3e9a10-1b2c-4d5e-8f90-a1b2c3d4e5f6";

    fn validator() -> TokenValidator {
        let config = ValidatorConfig {
            jwks_url: "http://127.0.0.1:9/certs".to_string(),
            issuers: vec![ISSUER.to_string()],
            algorithms: vec![Algorithm::HS256],
            allowed_parties: Vec::new(),
            refresh_interval: Duration::from_secs(3600),
        };
        let mut keys = HashMap::new();
        keys.insert("test-kid".to_string(), DecodingKey::from_secret(SECRET));
        TokenValidator::with_static_keys(config, keys)
    }

    fn token(sub: &str, roles: &[&str], external_uuid: Option<&str>) -> String {
        let claims = AccessClaims {
            sub: sub.to_string(),
            exp: get_current_timestamp() + 300,
            iss: Some(ISSUER.to_string()),
            azp: Some("auth-proxy".to_string()),
            preferred_username: Some("tester".to_string()),
            email: None,
            given_name: None,
            family_name: None,
            realm_roles: None,
            realm_access: Some(RealmAccess {
                roles: roles.iter().map(|r| r.to_string()).collect(),
            }),
            resource_access: None,
            external_uuid: external_uuid.map(str::to_string),
        };
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("test-kid".to_string());
        encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn hand_event(user: &str, amplitude: f64, frequency: f64) -> TelemetryEvent {
        TelemetryEvent {
            user_uuid: user.to_string(),
            prosthesis_type: "hand".to_string(),
            signal_duration: 250,
            signal_amplitude: amplitude,
            signal_frequency: frequency,
            created_ts: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        }
    }

    async fn test_app() -> (Router, Arc<MemoryTelemetrySource>) {
        let source = Arc::new(MemoryTelemetrySource::new());
        source
            .add_profile(Schema::Default, SUBJECT_A, "Prothetic One", "prothetic1@example.com")
            .await;
        source
            .add_profile(Schema::Default, SUBJECT_C, "Prothetic Three", "prothetic3@example.com")
            .await;

        let reports = ReportService::new(
            source.clone(),
            Arc::new(MemoryReportCache::new()),
            7,
            RetryPolicy {
                attempts: 2,
                base_delay: Duration::from_millis(1),
            },
        );
        let app = create_router(AppState {
            validator: validator(),
            roles: RolePolicy::default(),
            reports,
            cors_origins: vec!["http://localhost:3000".to_string()],
        });
        (app, source)
    }

    async fn post_report(app: &Router, bearer: Option<&str>, body: Value) -> Response {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/reports")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(bearer) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", bearer));
        }
        app.clone()
            .oneshot(builder.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_root_and_health() {
        let (app, _) = test_app().await;

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["service"], "reports");

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_or_invalid_bearer() {
        let (app, _) = test_app().await;

        let response = post_report(&app, None, json!({})).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["detail"], "Missing Bearer token");

        let response = post_report(&app, Some("not-a-jwt"), json!({})).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_subject_sees_own_report_fill_up() {
        let (app, source) = test_app().await;
        let bearer = token(SUBJECT_A, &["prosthetic_users"], None);

        let response = post_report(&app, Some(&bearer), json!({"schema": "default"})).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["user_name"], "Prothetic One");
        assert_eq!(body["total_events"], 0);
        assert_eq!(body["total_duration"], 0);
        assert_eq!(body["prosthesis_stats"], json!([]));
        assert_eq!(body["cached"], false);
        assert_eq!(body["ttl_days"], 7);

        for i in 0..10 {
            source
                .add_event(
                    Schema::Default,
                    hand_event(SUBJECT_A, 0.5 + i as f64 * 0.1, 40.0 + i as f64),
                )
                .await;
        }

        let response = post_report(&app, Some(&bearer), json!({"schema": "default"})).await;
        let body = body_json(response).await;
        assert_eq!(body["total_events"], 10);
        assert_eq!(body["total_duration"], 2500);

        let stats = body["prosthesis_stats"].as_array().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0]["prosthesis_type"], "hand");
        assert_eq!(stats[0]["events_count"], 10);
        assert!((stats[0]["avg_amplitude"].as_f64().unwrap() - 0.95).abs() < 1e-9);
        assert!((stats[0]["avg_frequency"].as_f64().unwrap() - 44.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_identical_requests_hit_cache() {
        let (app, source) = test_app().await;
        source
            .add_event(Schema::Default, hand_event(SUBJECT_A, 1.0, 50.0))
            .await;
        let bearer = token(SUBJECT_A, &["prosthetic_users"], None);

        let first = body_json(post_report(&app, Some(&bearer), json!({})).await).await;
        let second = body_json(
            post_report(&app, Some(&bearer), json!({"start_ts": null, "end_ts": null})).await,
        )
        .await;

        assert_eq!(first["cached"], false);
        assert_eq!(second["cached"], true);
        assert_eq!(first["created_at"], second["created_at"]);
        assert_eq!(first["prosthesis_stats"], second["prosthesis_stats"]);
    }

    #[tokio::test]
    async fn test_subject_cannot_read_other_subject() {
        let (app, _) = test_app().await;
        let bearer = token(SUBJECT_A, &["prosthetic_users"], None);

        let response = post_report(&app, Some(&bearer), json!({"user_uuid": SUBJECT_C})).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_caller_without_report_role_is_forbidden() {
        let (app, _) = test_app().await;
        let bearer = token(SUBJECT_C, &["offline_access"], None);

        let response = post_report(&app, Some(&bearer), json!({})).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = post_report(&app, Some(&bearer), json!({"user_uuid": SUBJECT_C})).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_reads_subject_report() {
        let (app, source) = test_app().await;
        source
            .add_event(Schema::Default, hand_event(SUBJECT_A, 1.0, 50.0))
            .await;
        let bearer = token("admin-subject", &["administrators"], None);

        let response = post_report(&app, Some(&bearer), json!({"user_uuid": SUBJECT_A})).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["user_email"], "prothetic1@example.com");
        assert_eq!(body["total_events"], 1);

        let response = post_report(&app, Some(&bearer), json!({"user_uuid": "nobody"})).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_external_uuid_identifies_caller() {
        let (app, _) = test_app().await;
        let bearer = token("local-keycloak-id", &["prosthetic_users"], Some(SUBJECT_A));

        let response = post_report(&app, Some(&bearer), json!({"user_uuid": SUBJECT_A})).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["user_name"], "Prothetic One");
    }

    #[tokio::test]
    async fn test_invalid_requests_are_422() {
        let (app, _) = test_app().await;
        let bearer = token(SUBJECT_A, &["administrators"], None);

        let cases = [
            json!({"schema": "public"}),
            json!({"start_ts": "last tuesday"}),
            json!({"user_uuid": "../etc"}),
            json!({"start_ts": "2024-02-01T00:00:00", "end_ts": "2024-01-01T00:00:00"}),
        ];
        for case in cases {
            let response = post_report(&app, Some(&bearer), case.clone()).await;
            assert_eq!(
                response.status(),
                StatusCode::UNPROCESSABLE_ENTITY,
                "case: {}",
                case
            );
            assert!(body_json(response).await["detail"].is_string());
        }
    }

    #[tokio::test]
    async fn test_unreachable_source_is_503() {
        let (app, source) = test_app().await;
        source.fail_next_reads(5);
        let bearer = token(SUBJECT_A, &["prosthetic_users"], None);

        let response = post_report(&app, Some(&bearer), json!({})).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

//! Session and login-state cookies

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use time::Duration;

use crate::config::ProxySettings;

const LOGIN_STATE_COOKIE_NAME: &str = "oauth_state";

/// Session cookie carrying the current session id.
pub fn session_cookie(settings: &ProxySettings, session_id: &str) -> Cookie<'static> {
    Cookie::build((settings.session_cookie_name.clone(), session_id.to_string()))
        .http_only(true)
        .secure(settings.session_cookie_secure)
        .same_site(SameSite::Strict)
        .path("/")
        .max_age(Duration::seconds(settings.session_lifetime_seconds as i64))
        .build()
}

/// Removal cookie for the session.
pub fn clear_session_cookie(settings: &ProxySettings) -> Cookie<'static> {
    Cookie::build((settings.session_cookie_name.clone(), ""))
        .path("/")
        .max_age(Duration::ZERO)
        .build()
}

/// Short-lived cookie binding the browser to its pending authorization request.
pub fn login_state_cookie(settings: &ProxySettings, state: &str) -> Cookie<'static> {
    Cookie::build((LOGIN_STATE_COOKIE_NAME, state.to_string()))
        .http_only(true)
        .secure(settings.session_cookie_secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(Duration::seconds(settings.login_state_ttl_seconds as i64))
        .build()
}

pub fn clear_login_state_cookie() -> Cookie<'static> {
    Cookie::build((LOGIN_STATE_COOKIE_NAME, ""))
        .path("/")
        .max_age(Duration::ZERO)
        .build()
}

pub fn session_id(jar: &CookieJar, settings: &ProxySettings) -> Option<String> {
    jar.get(&settings.session_cookie_name)
        .map(|c| c.value().to_string())
        .filter(|value| !value.is_empty())
}

pub fn login_state(jar: &CookieJar) -> Option<String> {
    jar.get(LOGIN_STATE_COOKIE_NAME)
        .map(|c| c.value().to_string())
}

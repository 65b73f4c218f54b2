//! Session proxy models

pub mod proxy;
pub mod session;
pub mod user;

// Re-export for convenience
pub use proxy::{ProxyRequest, Upstream, UpstreamMethod};
pub use session::{
    LoginState, Lookup, Replay, Rotation, SessionPointer, SessionRecord, TokenSet, classify,
    generate_session_id,
};
pub use user::UserInfo;

//! User-Agent string for all transfer traffic.

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/edo-platform/edo-transfer";

/// Default User-Agent for platform and object-store requests.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("edo-transfer/{version} (+{PROJECT_UA_URL})")
}

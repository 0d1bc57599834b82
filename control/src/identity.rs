use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::ApiError;
use crate::server::AppState;

/// How caller identities are classified. Controllers are recognized by an
/// e-mail domain chosen at deployment.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub enabled: bool,
    pub controller_domain: String,
    /// Identity injected when auth is disabled (development mode).
    pub mock_identity: String,
}

/// The principal behind a request, resolved once at the handler boundary.
/// Owners see and mutate only their own resources; controllers hold
/// system-wide read and status-write privileges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Owner(String),
    Controller(String),
}

impl Caller {
    pub fn email(&self) -> &str {
        match self {
            Caller::Owner(email) | Caller::Controller(email) => email,
        }
    }

    pub fn is_controller(&self) -> bool {
        matches!(self, Caller::Controller(_))
    }

    /// The owner predicate a store query must carry for this caller.
    /// `None` means unscoped (controller).
    pub fn owner_filter(&self) -> Option<&str> {
        match self {
            Caller::Owner(email) => Some(email),
            Caller::Controller(_) => None,
        }
    }

    pub fn can_read(&self, owner: &str) -> bool {
        match self {
            Caller::Owner(email) => email == owner,
            Caller::Controller(_) => true,
        }
    }

    pub fn can_mutate(&self, owner: &str) -> bool {
        match self {
            Caller::Owner(email) => email == owner,
            Caller::Controller(_) => true,
        }
    }

    pub fn can_report_status(&self) -> bool {
        self.is_controller()
    }
}

/// Classify a raw identity string. Empty or whitespace identities are
/// rejected; a suffix match on the controller domain selects the
/// controller class.
pub fn classify(identity: &str, auth: &AuthConfig) -> Option<Caller> {
    let identity = identity.trim();
    if identity.is_empty() {
        return None;
    }
    let suffix = format!("@{}", auth.controller_domain);
    if identity.ends_with(&suffix) {
        Some(Caller::Controller(identity.to_string()))
    } else {
        Some(Caller::Owner(identity.to_string()))
    }
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth = &state.auth;
        if !auth.enabled {
            return Ok(Caller::Controller(auth.mock_identity.clone()));
        }
        let identity = parts
            .headers
            .get("x-user-email")
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthenticated)?;
        classify(identity, auth).ok_or(ApiError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> AuthConfig {
        AuthConfig {
            enabled: true,
            controller_domain: "controllers.internal".into(),
            mock_identity: "mock@controllers.internal".into(),
        }
    }

    #[test]
    fn classifies_owner_and_controller() {
        let auth = auth();
        assert_eq!(
            classify("u@x.com", &auth),
            Some(Caller::Owner("u@x.com".into()))
        );
        assert_eq!(
            classify("gcp-ctrl@controllers.internal", &auth),
            Some(Caller::Controller("gcp-ctrl@controllers.internal".into()))
        );
    }

    #[test]
    fn rejects_blank_identities() {
        let auth = auth();
        assert_eq!(classify("", &auth), None);
        assert_eq!(classify("   ", &auth), None);
    }

    #[test]
    fn owners_are_isolated_controllers_are_not() {
        let owner = Caller::Owner("u@x.com".into());
        assert!(owner.can_read("u@x.com"));
        assert!(!owner.can_read("w@x.com"));
        assert!(!owner.can_mutate("w@x.com"));
        assert!(!owner.can_report_status());
        assert_eq!(owner.owner_filter(), Some("u@x.com"));

        let controller = Caller::Controller("ctrl@controllers.internal".into());
        assert!(controller.can_read("w@x.com"));
        assert!(controller.can_mutate("w@x.com"));
        assert!(controller.can_report_status());
        assert_eq!(controller.owner_filter(), None);
    }

    #[test]
    fn domain_match_is_a_suffix_not_a_substring() {
        let auth = auth();
        assert_eq!(
            classify("evil@controllers.internal.example.com", &auth),
            Some(Caller::Owner(
                "evil@controllers.internal.example.com".into()
            ))
        );
    }
}

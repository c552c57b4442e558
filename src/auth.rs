//! Static bearer-token authentication.
//!
//! The gateway compares the inbound `Authorization` header against a
//! `{label -> key}` map from configuration. The matched label travels with
//! the request for logging only. With no keys configured authentication is
//! disabled and every request is labelled `anonymous`.

use std::collections::HashMap;

use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Authentication disabled (no keys configured).
    Anonymous,
    /// Key matched the given label.
    Valid { label: String },
}

impl Verification {
    pub fn label(&self) -> &str {
        match self {
            Verification::Anonymous => "anonymous",
            Verification::Valid { label } => label,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiKeyAuth {
    /// key -> label, inverted from config for O(1) verification.
    keys: HashMap<String, String>,
}

impl ApiKeyAuth {
    pub fn new(labelled_keys: HashMap<String, String>) -> Self {
        let keys = labelled_keys
            .into_iter()
            .map(|(label, key)| (key, label))
            .collect();
        Self { keys }
    }

    pub fn enabled(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Verify the raw `Authorization` header value. Accepts both
    /// `Bearer <key>` and a bare key.
    pub fn verify(&self, header: Option<&str>) -> Result<Verification, GatewayError> {
        if self.keys.is_empty() {
            return Ok(Verification::Anonymous);
        }

        let raw = header.map(str::trim).filter(|s| !s.is_empty());
        let Some(raw) = raw else {
            return Err(GatewayError::MissingApiKey);
        };

        let token = raw
            .strip_prefix("Bearer ")
            .or_else(|| raw.strip_prefix("bearer "))
            .unwrap_or(raw)
            .trim();

        match self.keys.get(token) {
            Some(label) => Ok(Verification::Valid {
                label: label.clone(),
            }),
            None => Err(GatewayError::InvalidApiKey),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_with(label: &str, key: &str) -> ApiKeyAuth {
        ApiKeyAuth::new(HashMap::from([(label.to_string(), key.to_string())]))
    }

    #[test]
    fn disabled_auth_is_anonymous() {
        let auth = ApiKeyAuth::default();
        assert!(!auth.enabled());
        assert_eq!(auth.verify(None).unwrap().label(), "anonymous");
        assert_eq!(auth.verify(Some("anything")).unwrap().label(), "anonymous");
    }

    #[test]
    fn accepts_bearer_and_bare_forms() {
        let auth = auth_with("team-a", "sk-123");
        assert_eq!(
            auth.verify(Some("Bearer sk-123")).unwrap().label(),
            "team-a"
        );
        assert_eq!(auth.verify(Some("sk-123")).unwrap().label(), "team-a");
    }

    #[test]
    fn rejects_missing_and_unknown_keys() {
        let auth = auth_with("team-a", "sk-123");
        assert!(matches!(
            auth.verify(None),
            Err(GatewayError::MissingApiKey)
        ));
        assert!(matches!(
            auth.verify(Some("Bearer nope")),
            Err(GatewayError::InvalidApiKey)
        ));
    }
}

use std::future::Future;

use tracing::debug;

use patron_core::identity::AuthClaims;

/// External bearer-token verification capability. Authoritative and
/// side-effect free: `None` means the token is absent, expired, or rejected,
/// and the tool must not proceed.
pub trait TokenVerifier {
    fn verify(&self, bearer_token: &str) -> impl Future<Output = Option<AuthClaims>> + Send;
}

/// Verifies bearer tokens by asking the deployment's OIDC provider.
/// Signature, issuer, and expiry checks stay with the provider; this client
/// only forwards the token and reads back the claims.
#[derive(Debug, Clone)]
pub struct RemoteTokenVerifier {
    domain: String,
    audience: Option<String>,
    http: reqwest::Client,
}

impl RemoteTokenVerifier {
    pub fn new(domain: impl Into<String>, audience: Option<String>) -> Self {
        Self {
            domain: domain.into(),
            audience,
            http: reqwest::Client::new(),
        }
    }
}

impl TokenVerifier for RemoteTokenVerifier {
    fn verify(&self, bearer_token: &str) -> impl Future<Output = Option<AuthClaims>> + Send {
        let url = format!("https://{}/userinfo", self.domain.trim_end_matches('/'));
        let request = self.http.get(url).bearer_auth(bearer_token);
        async move {
            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    debug!(error = %err, "token verification request failed");
                    return None;
                }
            };
            if !response.status().is_success() {
                debug!(status = %response.status(), "token rejected by verifier");
                return None;
            }
            let claims: AuthClaims = match response.json().await {
                Ok(claims) => claims,
                Err(err) => {
                    debug!(error = %err, "malformed claims from verifier");
                    return None;
                }
            };
            if audience_acceptable(self.audience.as_deref(), claims.aud.as_deref()) {
                Some(claims)
            } else {
                debug!("token audience mismatch");
                None
            }
        }
    }
}

/// An audience check only applies when the deployment configures one and the
/// claims carry one.
fn audience_acceptable(expected: Option<&str>, actual: Option<&str>) -> bool {
    match (expected, actual) {
        (Some(expected), Some(actual)) => expected == actual,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audience_check_only_applies_when_both_sides_present() {
        assert!(audience_acceptable(None, None));
        assert!(audience_acceptable(None, Some("aud")));
        assert!(audience_acceptable(Some("aud"), None));
        assert!(audience_acceptable(Some("aud"), Some("aud")));
        assert!(!audience_acceptable(Some("aud"), Some("other")));
    }
}

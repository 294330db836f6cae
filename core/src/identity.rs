use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Typed identity signals extracted from one tool call. The call context
/// handed over by MCP clients has no guaranteed shape, so all extraction is
/// total: absent, wrong-typed, or empty-after-trim values become `None`.
/// Resolution logic downstream only ever sees this struct, never the raw
/// context object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityHints {
    /// Explicit session token carried by the context itself
    /// (`_meta.session_token`, then top-level `session_token`).
    pub session_token: Option<String>,
    /// First non-empty context-derived identity candidate, in fixed
    /// precedence order. Stable across calls within one conversation.
    pub context_id: Option<String>,
    /// Email asserted by the auth context (`auth.email`, then
    /// `_meta.auth.email`). Not yet normalized.
    pub auth_email: Option<String>,
    /// Bearer credential (`auth.token`, `_meta.auth.token`, or an
    /// `Authorization: Bearer ...` header).
    pub bearer_token: Option<String>,
}

impl IdentityHints {
    /// Adapter from the untyped call context (the `tools/call` params object,
    /// `_meta` included) into typed hints.
    pub fn from_call_context(context: &Value) -> Self {
        Self {
            session_token: non_empty_string(context.pointer("/_meta/session_token"))
                .or_else(|| non_empty_string(context.get("session_token"))),
            context_id: context_identity(context),
            auth_email: non_empty_string(context.pointer("/auth/email"))
                .or_else(|| non_empty_string(context.pointer("/_meta/auth/email"))),
            bearer_token: bearer_token(context),
        }
    }

    /// Fold verified token claims in as additional context. Claims never
    /// override signals the context already carried; verification and
    /// session resolution stay independent concerns.
    pub fn merge_claims(&mut self, claims: &AuthClaims) {
        if self.auth_email.is_none() {
            self.auth_email = claims
                .email
                .as_deref()
                .and_then(|email| non_empty_str(email));
        }
        if self.context_id.is_none() {
            self.context_id = non_empty_str(&claims.sub);
        }
    }
}

/// Claims returned by the external token verifier. Treated as authoritative;
/// this crate never inspects the raw token.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub aud: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Session-relevant fields of a tool's input arguments. Built with the same
/// total extraction rules as the context adapter: a wrong-typed field is
/// simply absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInput {
    pub session_token: Option<String>,
    pub email: Option<String>,
    pub region: Option<String>,
    pub roles: Vec<String>,
    pub tools_used: Vec<String>,
}

impl SessionInput {
    pub fn from_args(args: &serde_json::Map<String, Value>) -> Self {
        Self {
            session_token: non_empty_string(args.get("session_token")),
            email: non_empty_string(args.get("email")),
            region: non_empty_string(args.get("region")),
            roles: string_list(args.get("roles")),
            tools_used: string_list(args.get("tools_used")),
        }
    }
}

/// Trimmed non-empty string, or `None` for anything else.
pub fn non_empty_string(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).and_then(non_empty_str)
}

fn non_empty_str(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// String entries of an array, trimmed, empties dropped. Anything that is
/// not an array yields an empty list.
pub fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str())
                .filter_map(non_empty_str)
                .collect()
        })
        .unwrap_or_default()
}

/// Header lookup across both context shapes (`headers` and `_meta.headers`),
/// trying the name as given and its lower-cased form.
pub fn context_header(context: &Value, name: &str) -> Option<String> {
    let lookup = |key: &str| {
        non_empty_string(context.pointer(&format!("/headers/{key}")))
            .or_else(|| non_empty_string(context.pointer(&format!("/_meta/headers/{key}"))))
    };
    lookup(name).or_else(|| lookup(&name.to_ascii_lowercase()))
}

/// First non-empty context-derived identity candidate. The order is a fixed
/// tie-break contract: user id before conversation id before session id
/// before auth subject/email before forwarded headers.
pub fn context_identity(context: &Value) -> Option<String> {
    let candidates = [
        non_empty_string(context.pointer("/_meta/openai/user_id")),
        non_empty_string(context.pointer("/_meta/openai/conversation_id")),
        non_empty_string(context.pointer("/_meta/conversation_id")),
        non_empty_string(context.pointer("/_meta/session_id")),
        non_empty_string(context.get("sessionId")),
        non_empty_string(context.pointer("/auth/sub")),
        non_empty_string(context.pointer("/auth/email")),
        non_empty_string(context.pointer("/_meta/auth/email")),
        context_header(context, "x-openai-user-id"),
        context_header(context, "x-openai-conversation-id"),
    ];
    candidates.into_iter().flatten().next()
}

fn bearer_token(context: &Value) -> Option<String> {
    if let Some(token) = non_empty_string(context.pointer("/auth/token"))
        .or_else(|| non_empty_string(context.pointer("/_meta/auth/token")))
    {
        return Some(token);
    }
    context_header(context, "Authorization")
        .and_then(|value| value.strip_prefix("Bearer ").and_then(non_empty_str))
}

/// Trim + ASCII lowercase; emails are compared and keyed in this form only.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// Deterministic pseudo-email for a context identity. The same context key
/// always maps to the same address, which is what gives unauthenticated
/// conversations session continuity.
pub fn synthetic_email_for_context(context_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(context_key.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("mcp-user-{}@noauth.local", &digest[..16])
}

/// One-off guest identity for calls with no usable context signal at all.
/// No continuity is possible; every call becomes a new user.
pub fn guest_email() -> String {
    format!("mcp-guest-{}@noauth.local", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_empty_string_rejects_blank_and_wrong_types() {
        assert_eq!(
            non_empty_string(Some(&json!("  hello  "))),
            Some("hello".to_string())
        );
        assert_eq!(non_empty_string(Some(&json!("   "))), None);
        assert_eq!(non_empty_string(Some(&json!(42))), None);
        assert_eq!(non_empty_string(Some(&json!(["x"]))), None);
        assert_eq!(non_empty_string(None), None);
    }

    #[test]
    fn string_list_keeps_only_non_empty_strings() {
        assert_eq!(
            string_list(Some(&json!(["a", " b ", "", 7, null]))),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(string_list(Some(&json!("not-an-array"))).is_empty());
        assert!(string_list(None).is_empty());
    }

    #[test]
    fn context_header_is_case_insensitive_and_checks_meta() {
        let direct = json!({ "headers": { "x-openai-user-id": "u-1" } });
        assert_eq!(
            context_header(&direct, "X-OpenAI-User-Id").as_deref(),
            Some("u-1")
        );

        let nested = json!({ "_meta": { "headers": { "authorization": "Bearer tok" } } });
        assert_eq!(
            context_header(&nested, "Authorization").as_deref(),
            Some("Bearer tok")
        );
    }

    #[test]
    fn context_identity_respects_candidate_precedence() {
        let context = json!({
            "_meta": {
                "openai": { "user_id": "user-9", "conversation_id": "conv-1" },
                "session_id": "sess-2"
            },
            "auth": { "sub": "auth0|abc" }
        });
        assert_eq!(context_identity(&context).as_deref(), Some("user-9"));

        let without_user = json!({
            "_meta": { "openai": { "conversation_id": "conv-1" } },
            "auth": { "sub": "auth0|abc" }
        });
        assert_eq!(context_identity(&without_user).as_deref(), Some("conv-1"));

        let headers_only = json!({
            "headers": { "x-openai-conversation-id": "conv-h" }
        });
        assert_eq!(context_identity(&headers_only).as_deref(), Some("conv-h"));

        assert_eq!(context_identity(&json!({})), None);
        assert_eq!(context_identity(&json!(null)), None);
    }

    #[test]
    fn hints_prefer_meta_session_token_over_top_level() {
        let context = json!({
            "_meta": { "session_token": "meta-token" },
            "session_token": "top-token"
        });
        let hints = IdentityHints::from_call_context(&context);
        assert_eq!(hints.session_token.as_deref(), Some("meta-token"));

        let top_only = json!({ "session_token": "top-token" });
        let hints = IdentityHints::from_call_context(&top_only);
        assert_eq!(hints.session_token.as_deref(), Some("top-token"));
    }

    #[test]
    fn bearer_token_prefers_auth_context_then_header() {
        let auth = json!({ "auth": { "token": "from-auth" } });
        assert_eq!(
            IdentityHints::from_call_context(&auth)
                .bearer_token
                .as_deref(),
            Some("from-auth")
        );

        let header = json!({ "headers": { "authorization": "Bearer from-header" } });
        assert_eq!(
            IdentityHints::from_call_context(&header)
                .bearer_token
                .as_deref(),
            Some("from-header")
        );

        let not_bearer = json!({ "headers": { "authorization": "Basic abc" } });
        assert_eq!(
            IdentityHints::from_call_context(&not_bearer).bearer_token,
            None
        );
    }

    #[test]
    fn merge_claims_fills_gaps_without_overriding() {
        let mut hints = IdentityHints {
            auth_email: Some("kept@example.com".to_string()),
            ..IdentityHints::default()
        };
        let claims = AuthClaims {
            sub: "auth0|xyz".to_string(),
            email: Some("claims@example.com".to_string()),
            aud: None,
            scope: None,
        };
        hints.merge_claims(&claims);
        assert_eq!(hints.auth_email.as_deref(), Some("kept@example.com"));
        assert_eq!(hints.context_id.as_deref(), Some("auth0|xyz"));
    }

    #[test]
    fn synthetic_email_is_deterministic_per_context() {
        let a = synthetic_email_for_context("ctx:conv-1");
        let b = synthetic_email_for_context("ctx:conv-1");
        let c = synthetic_email_for_context("ctx:conv-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("mcp-user-"));
        assert!(a.ends_with("@noauth.local"));
    }

    #[test]
    fn guest_email_is_unique_per_call() {
        let a = guest_email();
        let b = guest_email();
        assert_ne!(a, b);
        assert!(a.starts_with("mcp-guest-"));
        assert!(a.ends_with("@noauth.local"));
    }

    #[test]
    fn session_input_tolerates_malformed_fields() {
        let args = json!({
            "session_token": 99,
            "email": " User@Example.COM ",
            "region": "",
            "roles": ["member", ""],
            "tools_used": "oops"
        });
        let input = SessionInput::from_args(args.as_object().unwrap());
        assert_eq!(input.session_token, None);
        assert_eq!(input.email.as_deref(), Some("User@Example.COM"));
        assert_eq!(input.region, None);
        assert_eq!(input.roles, vec!["member".to_string()]);
        assert!(input.tools_used.is_empty());
    }
}

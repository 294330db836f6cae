use reqwest::Method;
use serde_json::{Value, json};

use patron_core::error::{BackendError, codes};

use crate::session::{AuthExchange, AuthenticateRequest, AuthenticateResponse};

/// HTTP client for the Patron backend. One instance per server; reqwest
/// pools connections internally.
#[derive(Debug, Clone)]
pub struct BackendClient {
    api_url: String,
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn get_user_status(&self, session_token: &str) -> Result<Value, BackendError> {
        self.send(
            Method::GET,
            "/v1/users/status",
            &[],
            None,
            Some(session_token),
        )
        .await
    }

    pub async fn get_user_record(&self, session_token: &str) -> Result<Value, BackendError> {
        self.send(
            Method::GET,
            "/v1/users/record",
            &[],
            None,
            Some(session_token),
        )
        .await
    }

    pub async fn search_services(
        &self,
        query: &[(String, String)],
        session_token: Option<&str>,
    ) -> Result<Value, BackendError> {
        self.send(
            Method::GET,
            "/v1/services/search",
            query,
            None,
            session_token,
        )
        .await
    }

    pub async fn run_service(
        &self,
        service: &str,
        input: &str,
        session_token: &str,
    ) -> Result<Value, BackendError> {
        self.send(
            Method::POST,
            "/v1/services/run",
            &[],
            Some(json!({
                "service": service,
                "input": input,
                "session_token": session_token,
            })),
            Some(session_token),
        )
        .await
    }

    pub async fn get_task_details(
        &self,
        campaign_id: &str,
        session_token: &str,
    ) -> Result<Value, BackendError> {
        self.send(
            Method::GET,
            &format!("/v1/tasks/{campaign_id}"),
            &[],
            None,
            Some(session_token),
        )
        .await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<Value>,
        session_token: Option<&str>,
    ) -> Result<Value, BackendError> {
        let mut url =
            reqwest::Url::parse(&format!("{}{path}", self.api_url.trim_end_matches('/')))
                .map_err(|e| BackendError::Transport(format!("invalid API URL/path: {e}")))?;
        if !query.is_empty() {
            let mut qp = url.query_pairs_mut();
            for (k, v) in query {
                qp.append_pair(k, v);
            }
        }

        let mut request = self.http.request(method, url);
        if let Some(token) = session_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            BackendError::Transport(format!(
                "failed to reach Patron API at {}: {e}",
                self.api_url
            ))
        })?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BackendError::Transport(format!("failed to read response body: {e}")))?;
        let body = parse_response_body(&bytes);

        if !(200..=299).contains(&status) {
            return Err(api_error(status, body));
        }
        Ok(body)
    }
}

impl AuthExchange for BackendClient {
    fn authenticate(
        &self,
        request: &AuthenticateRequest,
    ) -> impl Future<Output = Result<AuthenticateResponse, BackendError>> + Send {
        async move {
            let body = self
                .send(
                    Method::POST,
                    "/v1/auth/session",
                    &[],
                    Some(json!(request)),
                    None,
                )
                .await?;
            serde_json::from_value(body).map_err(|e| {
                BackendError::Transport(format!("malformed authenticate response: {e}"))
            })
        }
    }
}

fn parse_response_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).to_string()))
}

/// Lift a non-2xx body into a structured error, keeping the backend's own
/// machine code and message when it sent one.
fn api_error(status: u16, body: Value) -> BackendError {
    let code = body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or(codes::BACKEND_ERROR)
        .to_string();
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("backend returned status {status}"));
    let details = body.get("details").cloned().filter(|v| !v.is_null());
    BackendError::Api {
        status,
        code,
        message,
        details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_keeps_backend_code_and_message() {
        let err = api_error(
            402,
            json!({
                "error": "budget_exhausted",
                "message": "Sponsor budget for this campaign is exhausted",
                "details": { "campaign_id": "c-1" }
            }),
        );
        assert_eq!(err.code(), "budget_exhausted");
        assert_eq!(
            err.details().unwrap()["campaign_id"],
            Value::String("c-1".to_string())
        );
        match err {
            BackendError::Api {
                status, message, ..
            } => {
                assert_eq!(status, 402);
                assert!(message.contains("exhausted"));
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn api_error_falls_back_for_unstructured_bodies() {
        let err = api_error(500, Value::String("Internal Server Error".to_string()));
        assert_eq!(err.code(), "backend_error");
        match err {
            BackendError::Api { message, .. } => {
                assert!(message.contains("500"));
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn response_body_parses_json_or_falls_back_to_text() {
        assert_eq!(parse_response_body(b""), Value::Null);
        assert_eq!(parse_response_body(b"{\"ok\":true}")["ok"], json!(true));
        assert_eq!(
            parse_response_body(b"plain text"),
            Value::String("plain text".to_string())
        );
    }
}

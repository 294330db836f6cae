use serde_json::{Map, Value, json};
use tokio::io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use patron_core::error::{BackendError, codes};
use patron_core::identity::{IdentityHints, SessionInput, non_empty_string};

pub mod backend;
pub mod session;
pub mod verify;

use backend::BackendClient;
use session::{SessionManager, now_ms};
use verify::{RemoteTokenVerifier, TokenVerifier};

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const MCP_SERVER_NAME: &str = "patron-mcp";

/// Deployment configuration for one server instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Base URL of the Patron backend API.
    pub api_url: String,
    /// Public URL of this MCP server, used only to build the OAuth discovery
    /// hint in unauthorized responses.
    pub public_url: String,
    /// When on, every session-requiring tool demands a verified bearer token
    /// and the no-auth bootstrapper is disabled.
    pub auth_enabled: bool,
    /// OIDC provider domain for bearer verification (required when
    /// `auth_enabled`).
    pub auth_domain: Option<String>,
    pub auth_audience: Option<String>,
}

/// MCP server over stdio. One instance owns the session cache for the whole
/// process lifetime; sessions do not survive a restart.
pub struct McpServer<V = RemoteTokenVerifier> {
    config: RuntimeConfig,
    backend: BackendClient,
    sessions: SessionManager,
    verifier: V,
}

impl McpServer<RemoteTokenVerifier> {
    pub fn new(config: RuntimeConfig) -> Self {
        let verifier = RemoteTokenVerifier::new(
            config.auth_domain.clone().unwrap_or_default(),
            config.auth_audience.clone(),
        );
        Self::with_verifier(config, verifier)
    }
}

impl<V: TokenVerifier> McpServer<V> {
    pub fn with_verifier(config: RuntimeConfig, verifier: V) -> Self {
        let backend = BackendClient::new(config.api_url.clone());
        Self {
            config,
            backend,
            sessions: SessionManager::new(),
            verifier,
        }
    }

    pub async fn serve_stdio(&self) -> Result<(), String> {
        info!(
            api_url = %self.config.api_url,
            auth_enabled = self.config.auth_enabled,
            "serving MCP over stdio"
        );

        let stdin = io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut stdout = io::stdout();

        loop {
            let incoming = read_framed_json(&mut reader)
                .await
                .map_err(|e| format!("Failed to read MCP message: {e}"))?;
            let Some(incoming) = incoming else {
                break;
            };

            let responses = self.handle_incoming_message(incoming).await;
            for response in responses {
                write_framed_json(&mut stdout, &response)
                    .await
                    .map_err(|e| format!("Failed to write MCP response: {e}"))?;
            }
        }

        Ok(())
    }

    pub async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // Most likely a client response; this server issues no outbound
            // requests.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id").cloned() {
            let result = self.handle_request(method, params).await;
            Some(match result {
                Ok(payload) => success_response(id, payload),
                Err(err) => error_response(id, err),
            })
        } else {
            // Notifications (initialized, cancelled, ...) need no reply.
            None
        }
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            "prompts/list" => Ok(json!({ "prompts": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
                "prompts": { "listChanged": false }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": "Patron exposes sponsor-paid services. Use search_services to discover what is available, then run_service to execute one. get_user_status, get_user_record, and get_task_details report on the current user. Sessions are established automatically when the deployment runs without authentication; otherwise complete the OAuth flow advertised in unauthorized responses and pass the issued session_token."
        })
    }

    /// Tool dispatch. The params object doubles as the call context: session
    /// and identity signals ride along in `_meta` and are extracted into
    /// typed hints before any tool logic runs.
    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        let context = Value::Object(params.clone());
        let mut hints = IdentityHints::from_call_context(&context);
        let input = SessionInput::from_args(&args);

        if requires_session(name) {
            if let Err(unauthorized) = self.guard(&mut hints).await {
                return Ok(unauthorized);
            }
        }

        self.execute_tool(name, &args, &input, &hints).await
    }

    /// Authenticated-tool guard. Verification is independent of session
    /// resolution: a verified identity only enriches the hints.
    async fn guard(&self, hints: &mut IdentityHints) -> Result<(), Value> {
        if !self.config.auth_enabled {
            return Ok(());
        }
        let Some(bearer) = hints.bearer_token.clone() else {
            return Err(self.unauthorized_response());
        };
        match self.verifier.verify(&bearer).await {
            Some(claims) => {
                hints.merge_claims(&claims);
                Ok(())
            }
            None => Err(self.unauthorized_response()),
        }
    }

    async fn execute_tool(
        &self,
        name: &str,
        args: &Map<String, Value>,
        input: &SessionInput,
        hints: &IdentityHints,
    ) -> Result<Value, RpcError> {
        if let Some(err) = explicit_token_error(input, hints) {
            return Ok(tool_error_result(&err));
        }

        match name {
            "search_services" => {
                let token = self.sessions.resolve(input, hints, now_ms());
                let query = search_query(args);
                Ok(self.backend_result(
                    name,
                    self.backend.search_services(&query, token.as_deref()).await,
                ))
            }
            "get_user_status" => {
                let token = match self.require_session(input, hints).await {
                    Ok(token) => token,
                    Err(result) => return Ok(result),
                };
                Ok(self.backend_result(name, self.backend.get_user_status(&token).await))
            }
            "get_user_record" => {
                let token = match self.require_session(input, hints).await {
                    Ok(token) => token,
                    Err(result) => return Ok(result),
                };
                Ok(self.backend_result(name, self.backend.get_user_record(&token).await))
            }
            "get_task_details" => {
                let Some(campaign_id) = non_empty_string(args.get("campaign_id")) else {
                    return Ok(tool_error_result(
                        &ToolError::new(
                            codes::VALIDATION_FAILED,
                            "get_task_details requires string field 'campaign_id'",
                        )
                        .with_field("campaign_id"),
                    ));
                };
                if uuid::Uuid::parse_str(&campaign_id).is_err() {
                    return Ok(tool_error_result(
                        &ToolError::new(codes::VALIDATION_FAILED, "campaign_id must be a UUID")
                            .with_field("campaign_id"),
                    ));
                }
                let token = match self.require_session(input, hints).await {
                    Ok(token) => token,
                    Err(result) => return Ok(result),
                };
                Ok(self.backend_result(
                    name,
                    self.backend.get_task_details(&campaign_id, &token).await,
                ))
            }
            "run_service" => {
                let Some(service) = non_empty_string(args.get("service")) else {
                    return Ok(tool_error_result(
                        &ToolError::new(
                            codes::VALIDATION_FAILED,
                            "run_service requires string field 'service'",
                        )
                        .with_field("service"),
                    ));
                };
                let Some(service_input) = non_empty_string(args.get("input")) else {
                    return Ok(tool_error_result(
                        &ToolError::new(
                            codes::VALIDATION_FAILED,
                            "run_service requires string field 'input'",
                        )
                        .with_field("input"),
                    ));
                };
                let token = match self.require_session(input, hints).await {
                    Ok(token) => token,
                    Err(result) => return Ok(result),
                };
                Ok(self.backend_result(
                    name,
                    self.backend
                        .run_service(&service, &service_input, &token)
                        .await,
                ))
            }
            _ => Err(RpcError::invalid_params(format!("Unknown tool: {name}"))),
        }
    }

    /// Resolve a session or bootstrap one (no-auth mode only). `Err` carries
    /// a finished tool result: unauthorized when no session can exist, or
    /// the propagated backend error when the exchange failed.
    async fn require_session(
        &self,
        input: &SessionInput,
        hints: &IdentityHints,
    ) -> Result<String, Value> {
        match self
            .sessions
            .resolve_or_create(
                &self.backend,
                self.config.auth_enabled,
                input,
                hints,
                now_ms(),
            )
            .await
        {
            Ok(Some(token)) => Ok(token),
            Ok(None) => Err(self.unauthorized_response()),
            Err(err) => {
                warn!(code = err.code(), "session bootstrap failed");
                Err(backend_error_result(&err))
            }
        }
    }

    fn backend_result(&self, tool: &str, outcome: Result<Value, BackendError>) -> Value {
        match outcome {
            Ok(body) => {
                let text = body
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| to_pretty_json(&body));
                json!({
                    "content": [{ "type": "text", "text": text }],
                    "structuredContent": body
                })
            }
            Err(err) => {
                warn!(tool, code = err.code(), "backend call failed");
                backend_error_result(&err)
            }
        }
    }

    fn unauthorized_response(&self) -> Value {
        unauthorized_response(&self.config.public_url)
    }
}

/// `search_services` is a public read; everything else belongs to a user.
fn requires_session(tool: &str) -> bool {
    !matches!(tool, "search_services")
}

/// Reject malformed explicitly-supplied tokens before any backend work, so
/// the caller is told to re-authenticate instead of retrying blindly.
/// Cache-resolved tokens were minted by the backend and are not re-checked.
fn explicit_token_error(input: &SessionInput, hints: &IdentityHints) -> Option<ToolError> {
    let explicit = hints
        .session_token
        .as_deref()
        .or(input.session_token.as_deref())?;
    if session::is_valid_session_token(explicit) {
        None
    } else {
        Some(
            ToolError::new(
                codes::INVALID_SESSION_TOKEN,
                "Invalid session_token format. Authenticate again and use the issued session token.",
            )
            .with_field("session_token"),
        )
    }
}

fn search_query(args: &Map<String, Value>) -> Vec<(String, String)> {
    let mut query = Vec::new();
    for key in ["q", "category", "intent"] {
        if let Some(value) = non_empty_string(args.get(key)) {
            query.push((key.to_string(), value));
        }
    }
    if let Some(budget) = args.get("max_budget_cents").and_then(Value::as_u64) {
        query.push(("max_budget_cents".to_string(), budget.to_string()));
    }
    query
}

/// Structured unauthorized result. The `mcp/www_authenticate` hint lets the
/// calling agent start the OAuth flow against this deployment.
pub fn unauthorized_response(public_url: &str) -> Value {
    json!({
        "content": [{ "type": "text", "text": "Login is required to perform this action." }],
        "_meta": {
            "mcp/www_authenticate": [format!(
                "Bearer resource_metadata=\"{}/.well-known/oauth-protected-resource\"",
                public_url.trim_end_matches('/')
            )]
        },
        "isError": true
    })
}

fn backend_error_result(err: &BackendError) -> Value {
    let mut meta = json!({ "code": err.code() });
    if let Some(details) = err.details() {
        meta["details"] = details.clone();
    }
    json!({
        "content": [{ "type": "text", "text": err.message() }],
        "_meta": meta,
        "isError": true
    })
}

fn tool_error_result(err: &ToolError) -> Value {
    json!({
        "content": [{ "type": "text", "text": err.message }],
        "_meta": err.to_value(),
        "isError": true
    })
}

#[derive(Debug, Clone)]
struct ToolError {
    code: String,
    message: String,
    field: Option<String>,
}

impl ToolError {
    fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
        }
    }

    fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    fn to_value(&self) -> Value {
        let mut payload = json!({ "code": self.code });
        if let Some(field) = &self.field {
            payload["field"] = Value::String(field.clone());
        }
        payload
    }
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
struct ToolDefinition {
    name: &'static str,
    description: &'static str,
    input_schema: Value,
}

fn tool_definitions() -> Vec<ToolDefinition> {
    let session_token_property = json!({
        "type": "string",
        "description": "Existing session token. Usually omitted; the server resolves the session from the call context."
    });

    vec![
        ToolDefinition {
            name: "search_services",
            description: "Search available sponsored services. Works without a session.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "q": { "type": "string", "description": "Free-text query" },
                    "category": { "type": "string" },
                    "max_budget_cents": { "type": "integer", "minimum": 0 },
                    "intent": { "type": "string" },
                    "session_token": session_token_property
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_user_status",
            description: "Show the user's registration state, completed tasks, and available services.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "session_token": session_token_property
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_user_record",
            description: "Show the user's service usage history, subsidy totals, and sponsor breakdown.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "session_token": session_token_property
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_task_details",
            description: "Fetch the required task details for a sponsor campaign.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "campaign_id": { "type": "string", "format": "uuid" },
                    "session_token": session_token_property
                },
                "required": ["campaign_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "run_service",
            description: "Execute a service with sponsor-paid billing.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "service": { "type": "string" },
                    "input": { "type": "string" },
                    "session_token": session_token_property
                },
                "required": ["service", "input"],
                "additionalProperties": false
            }),
        },
    ]
}

fn tools_list_payload() -> Value {
    let tools: Vec<Value> = tool_definitions()
        .into_iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": tool.input_schema,
            })
        })
        .collect();
    json!({ "tools": tools })
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    })
}

async fn read_framed_json(
    reader: &mut BufReader<tokio::io::Stdin>,
) -> Result<Option<Value>, std::io::Error> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        if line == "\r\n" {
            break;
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.to_ascii_lowercase().starts_with("content-length:") {
            let raw_len = line
                .split_once(':')
                .map(|(_, right)| right.trim())
                .unwrap_or_default();
            let parsed = raw_len.parse::<usize>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid Content-Length header",
                )
            })?;
            content_length = Some(parsed);
        }
    }

    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        )
    })?;
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;

    let json: Value = serde_json::from_slice(&payload).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Invalid JSON payload: {e}"),
        )
    })?;
    Ok(Some(json))
}

async fn write_framed_json(
    writer: &mut tokio::io::Stdout,
    value: &Value,
) -> Result<(), std::io::Error> {
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    let header = format!(
        "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
        body.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use patron_core::identity::AuthClaims;

    struct ApproveVerifier;

    impl TokenVerifier for ApproveVerifier {
        fn verify(&self, _bearer_token: &str) -> impl Future<Output = Option<AuthClaims>> + Send {
            async {
                Some(AuthClaims {
                    sub: "auth0|approved".to_string(),
                    email: Some("verified@example.com".to_string()),
                    aud: None,
                    scope: None,
                })
            }
        }
    }

    struct RejectVerifier;

    impl TokenVerifier for RejectVerifier {
        fn verify(&self, _bearer_token: &str) -> impl Future<Output = Option<AuthClaims>> + Send {
            async { None }
        }
    }

    fn test_config(auth_enabled: bool) -> RuntimeConfig {
        RuntimeConfig {
            // Unroutable port: any test that reaches the backend is a bug.
            api_url: "http://127.0.0.1:9".to_string(),
            public_url: "https://mcp.patron.test".to_string(),
            auth_enabled,
            auth_domain: None,
            auth_audience: None,
        }
    }

    fn tools_call_params(name: &str, arguments: Value, meta: Value) -> Value {
        json!({
            "name": name,
            "arguments": arguments,
            "_meta": meta
        })
    }

    fn www_authenticate(result: &Value) -> &str {
        result
            .pointer("/_meta/mcp~1www_authenticate/0")
            .and_then(Value::as_str)
            .expect("unauthorized result should carry the www_authenticate hint")
    }

    #[test]
    fn initialize_payload_names_server_and_protocol() {
        let server = McpServer::new(test_config(false));
        let payload = server.initialize_payload();
        assert_eq!(payload["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(payload["serverInfo"]["name"], MCP_SERVER_NAME);
        assert!(
            payload["instructions"]
                .as_str()
                .unwrap()
                .contains("search_services")
        );
    }

    #[test]
    fn tools_list_exposes_the_full_surface() {
        let payload = tools_list_payload();
        let names: Vec<&str> = payload["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|tool| tool["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "search_services",
                "get_user_status",
                "get_user_record",
                "get_task_details",
                "run_service"
            ]
        );
    }

    #[tokio::test]
    async fn rejects_wrong_jsonrpc_version() {
        let server = McpServer::new(test_config(false));
        let responses = server
            .handle_incoming_message(json!({ "jsonrpc": "1.0", "id": 1, "method": "ping" }))
            .await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let server = McpServer::new(test_config(false));
        let responses = server.handle_incoming_message(json!([])).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn auth_enabled_without_bearer_is_unauthorized() {
        let server = McpServer::with_verifier(test_config(true), ApproveVerifier);
        let result = server
            .handle_request(
                "tools/call",
                tools_call_params("get_user_status", json!({}), json!({})),
            )
            .await
            .unwrap();

        assert_eq!(result["isError"], json!(true));
        assert!(www_authenticate(&result).contains(
            "https://mcp.patron.test/.well-known/oauth-protected-resource"
        ));
    }

    #[tokio::test]
    async fn rejected_bearer_is_unauthorized() {
        let server = McpServer::with_verifier(test_config(true), RejectVerifier);
        let result = server
            .handle_request(
                "tools/call",
                tools_call_params(
                    "get_user_record",
                    json!({}),
                    json!({ "auth": { "token": "bad-token" } }),
                ),
            )
            .await
            .unwrap();
        assert_eq!(result["isError"], json!(true));
        assert!(www_authenticate(&result).starts_with("Bearer resource_metadata="));
    }

    #[tokio::test]
    async fn verified_bearer_without_session_is_still_unauthorized() {
        // Verification and session resolution are independent: a good bearer
        // token alone does not conjure a session in auth mode.
        let server = McpServer::with_verifier(test_config(true), ApproveVerifier);
        let result = server
            .handle_request(
                "tools/call",
                tools_call_params(
                    "get_user_status",
                    json!({}),
                    json!({ "auth": { "token": "good-token" } }),
                ),
            )
            .await
            .unwrap();
        assert_eq!(result["isError"], json!(true));
        assert!(result.pointer("/_meta/mcp~1www_authenticate").is_some());
    }

    #[tokio::test]
    async fn malformed_explicit_token_is_a_distinct_error() {
        let server = McpServer::new(test_config(false));
        let result = server
            .handle_request(
                "tools/call",
                tools_call_params(
                    "get_user_status",
                    json!({ "session_token": "not-a-uuid" }),
                    json!({}),
                ),
            )
            .await
            .unwrap();
        assert_eq!(result["isError"], json!(true));
        assert_eq!(result["_meta"]["code"], codes::INVALID_SESSION_TOKEN);
    }

    #[tokio::test]
    async fn search_services_checks_token_format_before_backend() {
        let server = McpServer::new(test_config(false));
        let result = server
            .handle_request(
                "tools/call",
                tools_call_params(
                    "search_services",
                    json!({ "q": "translation", "session_token": "garbage" }),
                    json!({}),
                ),
            )
            .await
            .unwrap();
        assert_eq!(result["_meta"]["code"], codes::INVALID_SESSION_TOKEN);
    }

    #[tokio::test]
    async fn run_service_validates_required_fields() {
        let server = McpServer::new(test_config(false));
        let result = server
            .handle_request(
                "tools/call",
                tools_call_params("run_service", json!({ "service": "translate" }), json!({})),
            )
            .await
            .unwrap();
        assert_eq!(result["isError"], json!(true));
        assert_eq!(result["_meta"]["code"], "validation_failed");
        assert_eq!(result["_meta"]["field"], "input");
    }

    #[tokio::test]
    async fn get_task_details_requires_uuid_campaign_id() {
        let server = McpServer::new(test_config(false));
        let result = server
            .handle_request(
                "tools/call",
                tools_call_params(
                    "get_task_details",
                    json!({ "campaign_id": "campaign-1" }),
                    json!({}),
                ),
            )
            .await
            .unwrap();
        assert_eq!(result["_meta"]["code"], "validation_failed");
        assert_eq!(result["_meta"]["field"], "campaign_id");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_rpc_error() {
        let server = McpServer::new(test_config(false));
        let err = server
            .handle_request(
                "tools/call",
                tools_call_params("drop_tables", json!({}), json!({})),
            )
            .await
            .expect_err("unknown tool must be an invalid-params error");
        assert_eq!(err.code, -32602);
    }

    #[test]
    fn search_query_drops_malformed_params() {
        let args = json!({
            "q": "  translation ",
            "category": 7,
            "max_budget_cents": 500,
            "intent": ""
        });
        let query = search_query(args.as_object().unwrap());
        assert_eq!(
            query,
            vec![
                ("q".to_string(), "translation".to_string()),
                ("max_budget_cents".to_string(), "500".to_string())
            ]
        );
    }
}

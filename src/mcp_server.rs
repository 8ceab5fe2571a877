use std::io::{BufRead, BufReader, Write};
use serde::{Deserialize, Serialize};

use crate::error::{McpError, Result};
use crate::gate::{DenyReason, GateDecision, MutationGate, OwnershipGate};
use crate::mode::ServerConfig;
use crate::tags::TagInspector;
use crate::use_aws::{AwsCliTagInspector, AwsProcess, CommandRunner, UseAws, UseAwsRequest, UseAwsResponse};

/// Tool schemas advertised through `tools/list`.
const TOOLS_SCHEMA: &str = include_str!("../schema.json");

/// JSON-RPC message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    pub method: String,
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

const PARSE_ERROR: i32 = -32700;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;
const TOOL_FAILED: i32 = -32000;

impl JsonRpcResponse {
    fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: serde_json::Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// Supplies the tag inspector for one tool call.
pub trait TaggingBackend: Send + Sync {
    type Inspector: TagInspector;

    fn inspector_for(&self, call: &UseAws) -> Self::Inspector;
}

/// Looks tags up with the region and profile of the call being gated.
#[derive(Debug, Clone, Copy, Default)]
pub struct AwsCliTagging;

impl TaggingBackend for AwsCliTagging {
    type Inspector = AwsCliTagInspector;

    fn inspector_for(&self, call: &UseAws) -> AwsCliTagInspector {
        AwsCliTagInspector::for_call(call)
    }
}

/// MCP Server implementation
pub struct AwsMcpServer<T = AwsCliTagging, R = AwsProcess> {
    stdin: std::io::Stdin,
    stdout: std::io::Stdout,
    config: ServerConfig,
    tagging: T,
    runner: R,
}

impl AwsMcpServer {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_backends(config, AwsCliTagging, AwsProcess)
    }
}

impl<T: TaggingBackend, R: CommandRunner> AwsMcpServer<T, R> {
    /// `tagging` answers ownership lookups; `runner` executes the gated call and any post-create stamping.
    pub fn with_backends(config: ServerConfig, tagging: T, runner: R) -> Self {
        Self {
            stdin: std::io::stdin(),
            stdout: std::io::stdout(),
            config,
            tagging,
            runner,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        let reader = BufReader::new(self.stdin.lock());

        for line in reader.lines() {
            let line = line.map_err(McpError::Io)?;
            if line.trim().is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<JsonRpcMessage>(&line) {
                Ok(message) => self.handle_message(message).await?,
                Err(e) => {
                    tracing::warn!("Discarding malformed message: {}", e);
                    Some(JsonRpcResponse::failure(
                        serde_json::Value::Null,
                        PARSE_ERROR,
                        format!("Parse error: {}", e),
                    ))
                }
            };

            if let Some(response) = response {
                let response_str = serde_json::to_string(&response)?;
                writeln!(self.stdout, "{}", response_str)?;
                self.stdout.flush()?;
            }
        }

        Ok(())
    }

    async fn handle_message(&mut self, message: JsonRpcMessage) -> Result<Option<JsonRpcResponse>> {
        match message {
            JsonRpcMessage::Request(request) => {
                let response = self.handle_request(request).await?;
                Ok(Some(response))
            }
            JsonRpcMessage::Notification(notification) => {
                self.handle_notification(notification).await?;
                Ok(None)
            }
            JsonRpcMessage::Response(_) => {
                // We don't send requests, so we shouldn't receive responses
                Ok(None)
            }
        }
    }

    pub async fn handle_request(&mut self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        match request.method.as_str() {
            "initialize" => self.handle_initialize(request).await,
            "tools/call" => self.handle_tool_call(request).await,
            "tools/list" => self.handle_tools_list(request).await,
            _ => Ok(JsonRpcResponse::failure(
                request.id,
                METHOD_NOT_FOUND,
                format!("Method '{}' not found", request.method),
            )),
        }
    }

    async fn handle_initialize(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let capabilities = serde_json::json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {
                "tools": {
                    "listChanged": true
                }
            },
            "serverInfo": {
                "name": "aws_mutation_gate",
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        Ok(JsonRpcResponse::success(request.id, capabilities))
    }

    async fn handle_tools_list(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let tools_json = match serde_json::from_str::<serde_json::Value>(TOOLS_SCHEMA) {
            Ok(json) => json,
            Err(e) => {
                return Ok(JsonRpcResponse::failure(
                    request.id,
                    INTERNAL_ERROR,
                    format!("Failed to parse tool schema: {}", e),
                ));
            }
        };

        // The MCP client expects the result to be { "tools": [...] }
        match tools_json.get("tools") {
            Some(tools) => Ok(JsonRpcResponse::success(
                request.id,
                serde_json::json!({ "tools": tools }),
            )),
            None => Ok(JsonRpcResponse::failure(
                request.id,
                INTERNAL_ERROR,
                "Tool schema does not contain a 'tools' key",
            )),
        }
    }

    async fn handle_tool_call(&mut self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let Some(params) = request.params else {
            return Ok(JsonRpcResponse::failure(
                request.id,
                INVALID_PARAMS,
                "Missing params for tools/call",
            ));
        };

        let tool_call: ToolCall = match serde_json::from_value(params) {
            Ok(call) => call,
            Err(e) => {
                return Ok(JsonRpcResponse::failure(
                    request.id,
                    INVALID_PARAMS,
                    format!("Invalid tools/call params: {}", e),
                ));
            }
        };

        match tool_call.name.as_str() {
            "use_aws" => self.handle_use_aws(request.id, tool_call.arguments).await,
            "get_permission_mode" => Ok(JsonRpcResponse::success(request.id, self.permission_mode_result())),
            _ => Ok(JsonRpcResponse::failure(
                request.id,
                METHOD_NOT_FOUND,
                format!("Tool '{}' not found", tool_call.name),
            )),
        }
    }

    async fn handle_use_aws(&self, id: serde_json::Value, arguments: serde_json::Value) -> Result<JsonRpcResponse> {
        let use_aws_request: UseAwsRequest = match serde_json::from_value(arguments) {
            Ok(request) => request,
            Err(e) => {
                return Ok(JsonRpcResponse::failure(
                    id,
                    INVALID_PARAMS,
                    format!("Invalid use_aws arguments: {}", e),
                ));
            }
        };

        let mut use_aws = UseAws::from(use_aws_request);
        if let Err(e) = use_aws.validate() {
            return Ok(JsonRpcResponse::failure(id, INVALID_PARAMS, e.to_string()));
        }

        if use_aws.requires_acceptance() {
            tracing::info!(
                service = %use_aws.service_name,
                operation = %use_aws.operation_name,
                kind = %use_aws.operation_kind(),
                "gating mutating call"
            );
        }

        let gate = MutationGate::new(&self.config, self.tagging.inspector_for(&use_aws));
        let obligation = match gate.authorize(&use_aws.mutation_request()).await {
            GateDecision::Allow => None,
            GateDecision::AllowCreate(obligation) => Some(obligation),
            GateDecision::Deny(reason) => {
                return Ok(JsonRpcResponse::success(id, permission_denied(reason, &use_aws)));
            }
        };
        let tagged_on_create = obligation
            .as_ref()
            .is_some_and(|o| use_aws.attach_ownership_tag(o.tag()));

        // Generate a human-readable description of the command
        let mut description_output = Vec::new();
        if let Err(e) = use_aws.queue_description(&mut description_output) {
            tracing::warn!("Failed to generate command description: {}", e);
        }

        let invoke_output = match use_aws.invoke(&self.runner).await {
            Ok(output) => output,
            Err(e) => {
                return Ok(JsonRpcResponse::failure(
                    id,
                    TOOL_FAILED,
                    format!("Tool execution failed: {}", e),
                ));
            }
        };

        let mut notes = Vec::new();
        if let Some(obligation) = &obligation {
            let tag = obligation.tag();
            if tagged_on_create {
                notes.push(format!("Ownership tag {}={} applied at creation.", tag.key, tag.value));
            } else {
                match use_aws
                    .stamp_created_resource(&self.runner, &invoke_output, tag)
                    .await {
                    Ok(arn) => notes.push(format!("Ownership tag {}={} applied to {}.", tag.key, tag.value, arn)),
                    Err(e) => {
                        tracing::error!(
                            service = %use_aws.service_name,
                            operation = %use_aws.operation_name,
                            "created resource could not be tagged: {:#}",
                            e
                        );
                        notes.push(format!(
                            "CRITICAL: the resource was created but could not be tagged with {}={} ({:#}). \
                             This server will refuse to modify it until the tag is added manually.",
                            tag.key, tag.value, e
                        ));
                    }
                }
            }
        }

        let response: UseAwsResponse = invoke_output.into();
        let description = String::from_utf8(description_output).unwrap_or_default();
        let notes = notes.iter().map(|n| format!("\n\n{}", n)).collect::<String>();

        let tool_result = serde_json::json!({
            "content": [
                {
                    "type": "text",
                    "text": format!("{}{}\n\nResult:\n{}",
                        description,
                        notes,
                        serde_json::to_string(&response)?
                    )
                }
            ]
        });

        Ok(JsonRpcResponse::success(id, tool_result))
    }

    fn permission_mode_result(&self) -> serde_json::Value {
        let mode = self.config.mode;
        let report = serde_json::json!({
            "mode": mode.as_str(),
            "allows_writes": mode.allows_writes(),
            "allows_creation": mode.allows_creation(),
            "ownership_tag": self.config.marker.stamp(),
            "accepted_versions": self.config.marker.accepted_versions(),
        });
        serde_json::json!({
            "content": [
                {
                    "type": "text",
                    "text": report.to_string()
                }
            ]
        })
    }

    async fn handle_notification(&self, notification: JsonRpcNotification) -> Result<()> {
        match notification.method.as_str() {
            "notifications/initialized" => {
                tracing::debug!("client initialized");
                Ok(())
            }
            _ => {
                // Ignore unknown notifications
                Ok(())
            }
        }
    }
}

/// Tool result for a refused call; agents read `reason` to decide what to do next.
fn permission_denied(reason: DenyReason, call: &UseAws) -> serde_json::Value {
    let payload = serde_json::json!({
        "error": "permission_denied",
        "reason": reason,
        "message": reason.message(),
        "service_name": call.service_name,
        "operation_name": call.operation_name,
        "operation_kind": call.operation_kind(),
        "resource_id": call.resource_id,
    });
    serde_json::json!({
        "content": [
            {
                "type": "text",
                "text": payload.to_string()
            }
        ],
        "isError": true
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::error::TagLookupError;
    use crate::mode::ServerMode;
    use crate::tags::{OwnershipTag, TagLookup, OWNERSHIP_TAG_KEY};
    use crate::use_aws::{AwsCli, CliOutput};

    const BROKER_ARN: &str = "arn:aws:mq:us-east-1:123456789012:broker:orders:b-1234";

    /// Every resource carries the same fixed tag set.
    struct StaticInspector {
        tags: Vec<(String, String)>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TagInspector for StaticInspector {
        async fn fetch_ownership_tag(&self, _resource_id: &str) -> std::result::Result<TagLookup, TagLookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TagLookup::from_tags(self.tags.clone()))
        }
    }

    struct StaticTagging(Arc<StaticInspector>);

    impl TaggingBackend for StaticTagging {
        type Inspector = Arc<StaticInspector>;

        fn inspector_for(&self, _call: &UseAws) -> Arc<StaticInspector> {
            self.0.clone()
        }
    }

    /// Records every CLI invocation and answers with canned output.
    #[derive(Default)]
    struct ScriptedRunner {
        stdout: String,
        stamping_fails: bool,
        calls: Mutex<Vec<(String, String, Vec<(String, String)>)>>,
    }

    impl ScriptedRunner {
        fn replying(stdout: &str) -> Self {
            Self {
                stdout: stdout.to_string(),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<(String, String, Vec<(String, String)>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            _target: &AwsCli,
            service: &str,
            operation: &str,
            args: &[(String, String)],
        ) -> eyre::Result<CliOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((service.to_string(), operation.to_string(), args.to_vec()));
            if operation == "tag-resources" && self.stamping_fails {
                return Ok(CliOutput {
                    status: 254,
                    stdout: String::new(),
                    stderr: "An error occurred (AccessDeniedException) when calling the TagResources operation"
                        .to_string(),
                });
            }
            let stdout = if operation == "tag-resources" {
                r#"{"FailedResourcesMap": {}}"#.to_string()
            } else {
                self.stdout.clone()
            };
            Ok(CliOutput {
                status: 0,
                stdout,
                stderr: String::new(),
            })
        }
    }

    type TestServer = AwsMcpServer<StaticTagging, Arc<ScriptedRunner>>;

    fn server(mode: ServerMode, tags: &[(&str, &str)]) -> (TestServer, Arc<StaticInspector>) {
        let (server, inspector, _) = server_with_runner(mode, tags, ScriptedRunner::default());
        (server, inspector)
    }

    fn server_with_runner(
        mode: ServerMode,
        tags: &[(&str, &str)],
        runner: ScriptedRunner,
    ) -> (TestServer, Arc<StaticInspector>, Arc<ScriptedRunner>) {
        let inspector = Arc::new(StaticInspector {
            tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            calls: AtomicUsize::new(0),
        });
        let runner = Arc::new(runner);
        let server = AwsMcpServer::with_backends(
            ServerConfig::with_mode(mode),
            StaticTagging(inspector.clone()),
            runner.clone(),
        );
        (server, inspector, runner)
    }

    fn result_text(response: &JsonRpcResponse) -> String {
        let result = response.result.as_ref().expect("tool result");
        assert!(result.get("isError").is_none());
        result["content"][0]["text"].as_str().unwrap().to_string()
    }

    fn request(method: &str, params: Option<serde_json::Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: serde_json::json!(1),
            method: method.to_string(),
            params,
        }
    }

    fn call_tool(name: &str, arguments: serde_json::Value) -> JsonRpcRequest {
        request(
            "tools/call",
            Some(serde_json::json!({ "name": name, "arguments": arguments })),
        )
    }

    /// Parses the JSON payload carried in the first text content block.
    fn denial_payload(response: &JsonRpcResponse) -> serde_json::Value {
        let result = response.result.as_ref().expect("tool result");
        assert_eq!(result["isError"], serde_json::json!(true));
        let text = result["content"][0]["text"].as_str().unwrap();
        serde_json::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_and_list_tools() {
        let (mut server, _) = server(ServerMode::ReadOnly, &[]);

        let response = server.handle_request(request("initialize", None)).await.unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "aws_mutation_gate");

        let response = server.handle_request(request("tools/list", None)).await.unwrap();
        let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
        let names: Vec<_> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
        assert!(names.contains(&"use_aws"));
        assert!(names.contains(&"get_permission_mode"));
    }

    #[tokio::test]
    async fn test_unknown_method_and_tool() {
        let (mut server, _) = server(ServerMode::ReadOnly, &[]);

        let response = server.handle_request(request("resources/list", None)).await.unwrap();
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);

        let response = server
            .handle_request(call_tool("delete_everything", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_permission_mode_report() {
        let (mut server, _) = server(ServerMode::AllowWrite, &[]);
        let response = server
            .handle_request(call_tool("get_permission_mode", serde_json::json!({})))
            .await
            .unwrap();
        let result = response.result.unwrap();
        let report: serde_json::Value = serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(report["mode"], "allow_write");
        assert_eq!(report["allows_writes"], true);
        assert_eq!(report["allows_creation"], false);
        assert_eq!(report["ownership_tag"]["key"], "mcp_server_version");
    }

    #[tokio::test]
    async fn test_read_only_server_refuses_delete_without_lookup() {
        let (mut server, inspector) = server(ServerMode::ReadOnly, &[("mcp_server_version", "1.0.0")]);
        let response = server
            .handle_request(call_tool(
                "use_aws",
                serde_json::json!({
                    "service_name": "mq",
                    "operation_name": "delete-broker",
                    "parameters": { "broker-id": "b-1234" },
                    "region": "us-east-1",
                    "resource_id": BROKER_ARN
                }),
            ))
            .await
            .unwrap();

        let payload = denial_payload(&response);
        assert_eq!(payload["error"], "permission_denied");
        assert_eq!(payload["reason"], "server_read_only");
        assert_eq!(payload["operation_kind"], "delete");
        assert_eq!(payload["resource_id"], BROKER_ARN);
        assert_eq!(inspector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unowned_resource_is_refused() {
        let (mut server, inspector) = server(ServerMode::AllowWrite, &[("team", "payments")]);
        let response = server
            .handle_request(call_tool(
                "use_aws",
                serde_json::json!({
                    "service_name": "mq",
                    "operation_name": "update-broker",
                    "parameters": { "broker-id": "b-1234" },
                    "region": "us-east-1",
                    "resource_id": BROKER_ARN
                }),
            ))
            .await
            .unwrap();

        assert_eq!(denial_payload(&response)["reason"], "resource_not_owned");
        assert_eq!(inspector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_without_creation_mode_is_refused() {
        let (mut server, _) = server(ServerMode::AllowWrite, &[]);
        let response = server
            .handle_request(call_tool(
                "use_aws",
                serde_json::json!({
                    "service_name": "sqs",
                    "operation_name": "create-queue",
                    "parameters": { "queue-name": "orders" },
                    "region": "us-east-1"
                }),
            ))
            .await
            .unwrap();

        let payload = denial_payload(&response);
        assert_eq!(payload["reason"], "creation_disabled");
        assert!(payload["message"].as_str().unwrap().contains("--allow-resource-creation"));
    }

    #[tokio::test]
    async fn test_mutation_without_resource_id_is_invalid() {
        let (mut server, inspector) = server(ServerMode::AllowWrite, &[]);
        let response = server
            .handle_request(call_tool(
                "use_aws",
                serde_json::json!({
                    "service_name": "sns",
                    "operation_name": "delete-topic",
                    "region": "us-east-1"
                }),
            ))
            .await
            .unwrap();

        let error = response.error.unwrap();
        assert_eq!(error.code, INVALID_PARAMS);
        assert!(error.message.contains("resource_id"));
        assert_eq!(inspector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_owned_resource_id_cannot_cover_another_target() {
        let (mut server, inspector, runner) =
            server_with_runner(ServerMode::AllowWrite, &[("mcp_server_version", "1.0.0")], ScriptedRunner::default());
        let response = server
            .handle_request(call_tool(
                "use_aws",
                serde_json::json!({
                    "service_name": "mq",
                    "operation_name": "delete-broker",
                    "parameters": { "broker-id": "b-NOT-OURS" },
                    "region": "us-east-1",
                    "resource_id": BROKER_ARN
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
        assert_eq!(inspector.calls.load(Ordering::SeqCst), 0);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_owned_resource_delete_reaches_the_cli() {
        let (mut server, inspector, runner) =
            server_with_runner(ServerMode::AllowWrite, &[("mcp_server_version", "1.0.0")], ScriptedRunner::default());
        let response = server
            .handle_request(call_tool(
                "use_aws",
                serde_json::json!({
                    "service_name": "mq",
                    "operation_name": "delete-broker",
                    "parameters": { "broker-id": "b-1234" },
                    "region": "us-east-1",
                    "resource_id": BROKER_ARN
                }),
            ))
            .await
            .unwrap();

        assert!(result_text(&response).contains("\"exit_status\":\"0\""));
        assert_eq!(inspector.calls.load(Ordering::SeqCst), 1);
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!((calls[0].0.as_str(), calls[0].1.as_str()), ("mq", "delete-broker"));
        assert_eq!(calls[0].2, vec![("--broker-id".to_string(), "b-1234".to_string())]);
    }

    #[tokio::test]
    async fn test_tag_edit_on_foreign_resource_is_refused() {
        let (mut server, inspector, runner) =
            server_with_runner(ServerMode::AllowCreate, &[("team", "payments")], ScriptedRunner::default());
        let foreign = "arn:aws:mq:us-east-1:123456789012:broker:theirs:b-9999";
        let response = server
            .handle_request(call_tool(
                "use_aws",
                serde_json::json!({
                    "service_name": "mq",
                    "operation_name": "create-tags",
                    "parameters": { "resource-arn": foreign, "tags": "{\"team\": \"ops\"}" },
                    "region": "us-east-1",
                    "resource_id": foreign
                }),
            ))
            .await
            .unwrap();

        let payload = denial_payload(&response);
        assert_eq!(payload["reason"], "resource_not_owned");
        assert_eq!(payload["operation_kind"], "update");
        assert_eq!(inspector.calls.load(Ordering::SeqCst), 1);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_carries_ownership_tag() {
        let (mut server, inspector, runner) = server_with_runner(
            ServerMode::AllowCreate,
            &[],
            ScriptedRunner::replying(r#"{"QueueUrl": "https://sqs.us-east-1.amazonaws.com/123456789012/orders"}"#),
        );
        let response = server
            .handle_request(call_tool(
                "use_aws",
                serde_json::json!({
                    "service_name": "sqs",
                    "operation_name": "create-queue",
                    "parameters": { "queue-name": "orders" },
                    "region": "us-east-1"
                }),
            ))
            .await
            .unwrap();

        let text = result_text(&response);
        assert!(text.contains("applied at creation"));
        assert_eq!(inspector.calls.load(Ordering::SeqCst), 0);

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        let (_, tags) = calls[0].2.iter().find(|(name, _)| name == "--tags").unwrap();
        let tags: serde_json::Value = serde_json::from_str(tags).unwrap();
        assert_eq!(tags[OWNERSHIP_TAG_KEY], OwnershipTag::current().value);
    }

    #[tokio::test]
    async fn test_create_without_tag_parameter_is_stamped_afterwards() {
        let repository = "arn:aws:ecr:us-east-1:123456789012:repository/orders";
        let (mut server, _, runner) = server_with_runner(
            ServerMode::AllowCreate,
            &[],
            ScriptedRunner::replying(&format!(r#"{{"repository": {{"repositoryArn": "{}"}}}}"#, repository)),
        );
        let response = server
            .handle_request(call_tool(
                "use_aws",
                serde_json::json!({
                    "service_name": "ecr",
                    "operation_name": "create-repository",
                    "parameters": { "repository-name": "orders" },
                    "region": "us-east-1"
                }),
            ))
            .await
            .unwrap();

        assert!(result_text(&response).contains(&format!("applied to {}", repository)));
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!((calls[1].0.as_str(), calls[1].1.as_str()), ("resourcegroupstaggingapi", "tag-resources"));
        assert!(calls[1].2.contains(&("--resource-arn-list".to_string(), repository.to_string())));
    }

    #[tokio::test]
    async fn test_failed_stamping_is_reported_as_critical() {
        let runner = ScriptedRunner {
            stamping_fails: true,
            ..ScriptedRunner::replying(r#"{"repository": {"repositoryArn": "arn:aws:ecr:us-east-1:123456789012:repository/orders"}}"#)
        };
        let (mut server, _, runner) = server_with_runner(ServerMode::AllowCreate, &[], runner);
        let response = server
            .handle_request(call_tool(
                "use_aws",
                serde_json::json!({
                    "service_name": "ecr",
                    "operation_name": "create-repository",
                    "parameters": { "repository-name": "orders" },
                    "region": "us-east-1"
                }),
            ))
            .await
            .unwrap();

        let text = result_text(&response);
        assert!(text.contains("CRITICAL"));
        assert!(text.contains(OWNERSHIP_TAG_KEY));
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_arguments_are_invalid_params() {
        let (mut server, _) = server(ServerMode::AllowWrite, &[]);
        let response = server
            .handle_request(call_tool("use_aws", serde_json::json!({ "service_name": "sqs" })))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);

        let response = server.handle_request(request("tools/call", None)).await.unwrap();
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }
}

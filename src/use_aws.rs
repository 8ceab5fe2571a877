use std::collections::HashMap;
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use bstr::ByteSlice;
use convert_case::{Case, Casing};
use crossterm::{
    queue,
    style,
};
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TagLookupError;
use crate::gate::{MutationRequest, OperationKind};
use crate::tags::{OwnershipTag, TagInspector, TagLookup, OWNERSHIP_TAG_KEY};
use crate::{InvokeOutput, MAX_TOOL_RESPONSE_SIZE, OutputKind};

const READ_VERBS: [&str; 13] = [
    "get", "describe", "list", "ls", "search", "batch-get", "head", "query", "scan", "receive", "lookup", "wait",
    "validate",
];
const CREATE_VERBS: [&str; 6] = ["create", "run", "launch", "allocate", "import", "mb"];
const DELETE_VERBS: [&str; 8] = ["delete", "remove", "terminate", "purge", "deregister", "release", "rb", "rm"];
const RESTART_VERBS: [&str; 5] = ["reboot", "restart", "start", "stop", "failover"];

/// Words that mark an operation as editing tags of an existing resource.
const TAG_EDIT_WORDS: [&str; 3] = ["tag", "tags", "untag"];

/// Parameter names that address a resource when the service has no tagging profile.
const TARGET_NAMES: [&str; 4] = ["resource", "resources", "resource-id", "resource-ids"];
const TARGET_SUFFIXES: [&str; 8] = ["-arn", "-arns", "-arn-list", "-id", "-ids", "-url", "-urls", "-identifier"];

/// CLI error fragments that mean the addressed resource does not exist.
const NOT_FOUND_MARKERS: [&str; 4] = ["NotFound", "NonExistent", "does not exist", "No such"];

/// The environment variable name where we set additional metadata for the AWS CLI user agent.
const USER_AGENT_ENV_VAR: &str = "AWS_EXECUTION_ENV";
const USER_AGENT_APP_NAME: &str = "MutationGate-MCP-Server";
const USER_AGENT_VERSION_KEY: &str = "Version";
const USER_AGENT_VERSION_VALUE: &str = env!("CARGO_PKG_VERSION");

const TAGGING_API: &str = "resourcegroupstaggingapi";

/// Wire shape of a tag set in a service's CLI input and output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagShape {
    /// `{"key": "value"}`
    StringMap,
    /// `[{"Key": "key", "Value": "value"}]`
    KeyValueList,
}

/// How one service lists tags, accepts them on create, and names its resources.
#[derive(Debug, Clone, Copy)]
pub struct ServiceTagging {
    pub service: &'static str,
    pub list_operation: &'static str,
    pub id_argument: &'static str,
    pub shape: TagShape,
    /// Create operations that make a top-level resource and take `--tags`.
    pub tagged_creates: &'static [&'static str],
    /// Parameters through which mutating calls address an existing resource.
    pub target_arguments: &'static [&'static str],
}

impl ServiceTagging {
    pub fn creates_tagged_resource(&self, operation_name: &str) -> bool {
        let name = kebab(operation_name);
        self.tagged_creates.iter().any(|op| *op == name)
    }
}

static SERVICE_TAGGING: [ServiceTagging; 6] = [
    ServiceTagging {
        service: "mq",
        list_operation: "list-tags",
        id_argument: "--resource-arn",
        shape: TagShape::StringMap,
        tagged_creates: &["create-broker", "create-configuration"],
        target_arguments: &["broker-id", "configuration-id", "resource-arn"],
    },
    ServiceTagging {
        service: "sns",
        list_operation: "list-tags-for-resource",
        id_argument: "--resource-arn",
        shape: TagShape::KeyValueList,
        tagged_creates: &["create-topic"],
        target_arguments: &["topic-arn", "resource-arn", "platform-application-arn", "endpoint-arn"],
    },
    ServiceTagging {
        service: "sqs",
        list_operation: "list-queue-tags",
        id_argument: "--queue-url",
        shape: TagShape::StringMap,
        tagged_creates: &["create-queue"],
        target_arguments: &["queue-url"],
    },
    ServiceTagging {
        service: "docdb",
        list_operation: "list-tags-for-resource",
        id_argument: "--resource-name",
        shape: TagShape::KeyValueList,
        tagged_creates: &[
            "create-db-cluster",
            "create-db-instance",
            "create-db-cluster-parameter-group",
            "create-db-subnet-group",
        ],
        target_arguments: &["db-cluster-identifier", "db-instance-identifier", "resource-name"],
    },
    ServiceTagging {
        service: "rds",
        list_operation: "list-tags-for-resource",
        id_argument: "--resource-name",
        shape: TagShape::KeyValueList,
        tagged_creates: &[
            "create-db-instance",
            "create-db-cluster",
            "create-db-parameter-group",
            "create-db-cluster-parameter-group",
            "create-db-subnet-group",
            "create-db-snapshot",
            "create-db-cluster-snapshot",
        ],
        target_arguments: &["db-cluster-identifier", "db-instance-identifier", "resource-name"],
    },
    ServiceTagging {
        service: "lambda",
        list_operation: "list-tags",
        id_argument: "--resource",
        shape: TagShape::StringMap,
        tagged_creates: &["create-function"],
        target_arguments: &["function-name", "resource"],
    },
];

pub fn service_tagging(service_name: &str) -> Option<&'static ServiceTagging> {
    SERVICE_TAGGING.iter().find(|p| p.service.eq_ignore_ascii_case(service_name.trim()))
}

fn kebab(name: &str) -> String {
    name.trim().trim_start_matches("--").to_case(Case::Kebab)
}

/// Tag and untag operations of any spelling (`create-tags`, `add-tags-to-resource`, `untag-queue`, ...).
pub fn is_tag_edit_operation(operation_name: &str) -> bool {
    kebab(operation_name)
        .split('-')
        .any(|word| TAG_EDIT_WORDS.contains(&word))
}

/// Maps a CLI operation name to the kind of change it makes.
///
/// Verbs that are not known to be reads are treated as mutations. Tag edits
/// always change an existing resource, whatever their verb.
pub fn classify_operation(operation_name: &str) -> OperationKind {
    let name = kebab(operation_name);
    let has_verb = |verbs: &[&str]| {
        verbs
            .iter()
            .any(|verb| name == *verb || name.starts_with(&format!("{}-", verb)))
    };

    if has_verb(&READ_VERBS[..]) {
        OperationKind::Read
    } else if is_tag_edit_operation(&name) {
        OperationKind::Update
    } else if has_verb(&CREATE_VERBS[..]) {
        OperationKind::Create
    } else if has_verb(&DELETE_VERBS[..]) {
        OperationKind::Delete
    } else if has_verb(&RESTART_VERBS[..]) {
        OperationKind::RebootOrRestart
    } else {
        OperationKind::Update
    }
}

/// Region and profile shared by every CLI process a tool call starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsCli {
    pub region: String,
    pub profile_name: Option<String>,
}

/// Exit status and captured streams of one AWS CLI process
#[derive(Debug)]
pub struct CliOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CliOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Executes one AWS CLI operation for a region/profile pair.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, target: &AwsCli, service: &str, operation: &str, args: &[(String, String)])
        -> Result<CliOutput>;
}

#[async_trait]
impl<T: CommandRunner + ?Sized> CommandRunner for Arc<T> {
    async fn run(
        &self,
        target: &AwsCli,
        service: &str,
        operation: &str,
        args: &[(String, String)],
    ) -> Result<CliOutput> {
        (**self).run(target, service, operation, args).await
    }
}

/// Spawns the `aws` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct AwsProcess;

#[async_trait]
impl CommandRunner for AwsProcess {
    async fn run(
        &self,
        target: &AwsCli,
        service: &str,
        operation: &str,
        args: &[(String, String)],
    ) -> Result<CliOutput> {
        let mut command = tokio::process::Command::new("aws");

        let existing = std::env::var(USER_AGENT_ENV_VAR).ok();
        command
            .env(USER_AGENT_ENV_VAR, user_agent_value(existing.as_deref()))
            .arg("--region")
            .arg(&target.region);
        if let Some(profile_name) = target.profile_name.as_deref() {
            command.arg("--profile").arg(profile_name);
        }
        command.arg(service).arg(operation);
        for (name, val) in args {
            command.arg(name);
            if !val.is_empty() {
                command.arg(val);
            }
        }

        tracing::debug!(service, operation, region = %target.region, "running aws cli");
        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .wrap_err_with(|| format!("Unable to spawn 'aws {} {}'", service, operation))?
            .wait_with_output()
            .await
            .wrap_err_with(|| format!("Unable to wait for 'aws {} {}'", service, operation))?;

        Ok(CliOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: output.stdout.to_str_lossy().into_owned(),
            stderr: output.stderr.to_str_lossy().into_owned(),
        })
    }
}

/// The main UseAws struct that handles AWS CLI operations
#[derive(Debug, Clone, Deserialize)]
pub struct UseAws {
    pub service_name: String,
    pub operation_name: String,
    pub parameters: Option<HashMap<String, serde_json::Value>>,
    pub region: String,
    pub profile_name: Option<String>,
    pub label: Option<String>,
    pub resource_id: Option<String>,
}

/// Request structure for MCP tool calls
#[derive(Debug, Clone, Deserialize)]
pub struct UseAwsRequest {
    pub service_name: String,
    pub operation_name: String,
    pub parameters: Option<HashMap<String, serde_json::Value>>,
    pub region: String,
    pub profile_name: Option<String>,
    pub label: Option<String>,
    /// ARN or endpoint of the resource an update, delete or restart acts on
    pub resource_id: Option<String>,
}

/// Response structure for MCP tool calls
#[derive(Debug, Serialize)]
pub struct UseAwsResponse {
    pub exit_status: String,
    pub stdout: String,
    pub stderr: String,
}

impl UseAws {
    /// Creates outside a service's tagged list (users, aliases, endpoints) change
    /// an existing parent resource and are gated as updates of it.
    pub fn operation_kind(&self) -> OperationKind {
        let kind = classify_operation(&self.operation_name);
        match service_tagging(&self.service_name) {
            Some(profile) if kind == OperationKind::Create && !profile.creates_tagged_resource(&self.operation_name) => {
                OperationKind::Update
            }
            _ => kind,
        }
    }

    pub fn requires_acceptance(&self) -> bool {
        self.operation_kind() != OperationKind::Read
    }

    pub fn mutation_request(&self) -> MutationRequest {
        MutationRequest::new(self.operation_kind(), self.resource_id.clone())
    }

    pub fn cli(&self) -> AwsCli {
        AwsCli {
            region: self.region.clone(),
            profile_name: self.profile_name.clone(),
        }
    }

    /// Rejects calls the gate could never reason about.
    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() || self.operation_name.trim().is_empty() {
            eyre::bail!("service_name and operation_name must not be empty");
        }
        let kind = self.operation_kind();
        let resource_id = self.resource_id.as_deref().map(str::trim).filter(|id| !id.is_empty());
        if self.touches_ownership_tag() {
            eyre::bail!(
                "operation '{}' would change the {} tag, which is never rewritten after creation",
                self.operation_name,
                OWNERSHIP_TAG_KEY
            );
        }
        if kind.targets_existing_resource() {
            let Some(resource_id) = resource_id else {
                eyre::bail!(
                    "operation '{}' is a {} and needs a resource_id (ARN or endpoint) so ownership can be checked",
                    self.operation_name,
                    kind
                );
            };
            self.check_target(resource_id)?;
        }
        Ok(())
    }

    /// Every parameter that addresses a resource must address `resource_id`, and at
    /// least one must, so the resource whose tags are checked is the one the CLI acts on.
    fn check_target(&self, resource_id: &str) -> Result<()> {
        let accepted = accepted_identifiers(resource_id);
        let profile = service_tagging(&self.service_name);
        let mut matched = false;

        for (name, value) in self.parameters.iter().flatten() {
            let name = kebab(name);
            let addresses_resource = match profile {
                Some(profile) => profile.target_arguments.contains(&name.as_str()),
                None => TARGET_NAMES.contains(&name.as_str()) || TARGET_SUFFIXES.iter().any(|s| name.ends_with(s)),
            };
            if !addresses_resource {
                continue;
            }
            let values = identifier_values(value);
            if values.is_empty() || !values.iter().all(|v| accepted.contains(v)) {
                eyre::bail!(
                    "parameter '{}' addresses a resource other than resource_id '{}'",
                    name,
                    resource_id
                );
            }
            matched = true;
        }

        if !matched {
            eyre::bail!(
                "no parameter of '{}' addresses resource_id '{}'; pass the resource's identifier in parameters",
                self.operation_name,
                resource_id
            );
        }
        Ok(())
    }

    /// Tag-editing calls whose arguments mention the ownership marker.
    fn touches_ownership_tag(&self) -> bool {
        if self.operation_kind() == OperationKind::Read || !is_tag_edit_operation(&self.operation_name) {
            return false;
        }
        self.parameters
            .iter()
            .flatten()
            .any(|(_, value)| value.to_string().contains(OWNERSHIP_TAG_KEY))
    }

    pub async fn invoke(&self, runner: &impl CommandRunner) -> Result<InvokeOutput> {
        let parameters = self.cli_parameters().unwrap_or_default();
        let output = runner
            .run(&self.cli(), &self.service_name, &self.operation_name, &parameters)
            .await
            .wrap_err_with(|| format!("Unable to run command '{:?}'", self))?;

        let stdout = truncate_output(&output.stdout, MAX_TOOL_RESPONSE_SIZE / 3);
        let stderr = truncate_output(&output.stderr, MAX_TOOL_RESPONSE_SIZE / 3);

        if output.success() {
            Ok(InvokeOutput {
                output: OutputKind::Json(serde_json::json!({
                    "exit_status": output.status.to_string(),
                    "stdout": stdout,
                    "stderr": stderr
                })),
            })
        } else {
            Err(eyre::eyre!(stderr))
        }
    }

    pub fn queue_description(&self, updates: &mut impl Write) -> Result<()> {
        queue!(
            updates,
            style::Print("Running aws cli command:\n\n"),
            style::Print(format!("Service name: {}\n", self.service_name)),
            style::Print(format!("Operation name: {}\n", self.operation_name)),
            style::Print(format!("Operation kind: {}\n", self.operation_kind())),
        )?;
        if let Some(ref resource_id) = self.resource_id {
            queue!(updates, style::Print(format!("Resource: {}\n", resource_id)))?;
        }
        if let Some(parameters) = &self.parameters {
            queue!(updates, style::Print("Parameters: \n".to_string()))?;
            for (name, value) in parameters {
                match value {
                    serde_json::Value::String(s) if s.is_empty() => {
                        queue!(updates, style::Print(format!("- {}\n", name)))?;
                    },
                    _ => {
                        queue!(updates, style::Print(format!("- {}: {}\n", name, value)))?;
                    },
                }
            }
        }

        if let Some(ref profile_name) = self.profile_name {
            queue!(updates, style::Print(format!("Profile name: {}\n", profile_name)))?;
        } else {
            queue!(updates, style::Print("Profile name: default\n".to_string()))?;
        }

        queue!(updates, style::Print(format!("Region: {}", self.region)))?;

        if let Some(ref label) = self.label {
            queue!(updates, style::Print(format!("\nLabel: {}", label)))?;
        }
        Ok(())
    }

    /// Puts the ownership tag on the create call itself.
    ///
    /// Returns false when the operation has no known tag-on-create parameter or an
    /// existing `tags` argument cannot be merged; the caller must then stamp the
    /// resource right after it is created.
    pub fn attach_ownership_tag(&mut self, tag: &OwnershipTag) -> bool {
        let Some(profile) = service_tagging(&self.service_name) else {
            return false;
        };
        if self.operation_kind() != OperationKind::Create || !profile.creates_tagged_resource(&self.operation_name) {
            return false;
        }
        let params = self.parameters.get_or_insert_with(HashMap::new);
        let key = params
            .keys()
            .find(|k| kebab(k) == "tags")
            .cloned()
            .unwrap_or_else(|| "tags".to_string());

        match merge_tag_parameter(params.get(&key), profile.shape, tag) {
            Some(merged) => {
                params.insert(key, Value::String(merged.to_string()));
                true
            }
            None => false,
        }
    }

    /// Tags a freshly created resource through the Resource Groups Tagging API.
    pub async fn stamp_created_resource(
        &self,
        runner: &impl CommandRunner,
        output: &InvokeOutput,
        tag: &OwnershipTag,
    ) -> Result<String> {
        let arn = match &output.output {
            OutputKind::Json(json) => json.get("stdout").and_then(Value::as_str).and_then(find_arn),
            OutputKind::Text(text) => find_arn(text),
        }
        .ok_or_else(|| eyre::eyre!("create output carries no resource ARN to tag"))?;

        let args = [
            ("--resource-arn-list".to_string(), arn.clone()),
            ("--tags".to_string(), format!("{}={}", tag.key, tag.value)),
            ("--output".to_string(), "json".to_string()),
        ];
        let result = runner.run(&self.cli(), TAGGING_API, "tag-resources", &args).await?;
        if !result.success() {
            eyre::bail!("tagging {} failed: {}", arn, result.stderr.trim());
        }
        let failed = serde_json::from_str::<Value>(result.stdout.trim())
            .ok()
            .and_then(|v| v.get("FailedResourcesMap").cloned())
            .is_some_and(|m| m.as_object().is_some_and(|m| !m.is_empty()));
        if failed {
            eyre::bail!("tagging {} was rejected: {}", arn, result.stdout.trim());
        }
        Ok(arn)
    }

    /// Returns the CLI arguments properly formatted as kebab case if parameters is
    /// [Option::Some], otherwise None
    fn cli_parameters(&self) -> Option<Vec<(String, String)>> {
        if let Some(parameters) = &self.parameters {
            let mut params = vec![];
            for (param_name, val) in parameters {
                let param_name = format!("--{}", param_name.trim_start_matches("--").to_case(Case::Kebab));
                let param_val = val.as_str().map(|s| s.to_string()).unwrap_or(val.to_string());
                params.push((param_name, param_val));
            }
            Some(params)
        } else {
            None
        }
    }
}

impl From<UseAwsRequest> for UseAws {
    fn from(request: UseAwsRequest) -> Self {
        Self {
            service_name: request.service_name,
            operation_name: request.operation_name,
            parameters: request.parameters,
            region: request.region,
            profile_name: request.profile_name,
            label: request.label,
            resource_id: request.resource_id,
        }
    }
}

impl From<InvokeOutput> for UseAwsResponse {
    fn from(output: InvokeOutput) -> Self {
        match output.output {
            OutputKind::Json(json) => {
                let exit_status = json.get("exit_status").and_then(|v| v.as_str()).unwrap_or("0").to_string();
                let stdout = json.get("stdout").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let stderr = json.get("stderr").and_then(|v| v.as_str()).unwrap_or("").to_string();
                Self {
                    exit_status,
                    stdout,
                    stderr,
                }
            }
            OutputKind::Text(text) => Self {
                exit_status: "0".to_string(),
                stdout: text,
                stderr: "".to_string(),
            },
        }
    }
}

/// Reads ownership tags through the AWS CLI, one process per lookup.
#[derive(Debug, Clone)]
pub struct AwsCliTagInspector {
    service_name: String,
    cli: AwsCli,
}

impl AwsCliTagInspector {
    pub fn new(service_name: impl Into<String>, cli: AwsCli) -> Self {
        Self {
            service_name: service_name.into(),
            cli,
        }
    }

    pub fn for_call(call: &UseAws) -> Self {
        Self::new(call.service_name.clone(), call.cli())
    }

    /// Services without a profile go through the Tagging API, which answers an
    /// empty mapping list both for unknown ARNs and for never-tagged resources.
    /// Both surface as `Absent`, so a missing resource there is denied as not owned.
    fn lookup_command(&self, resource_id: &str) -> (&'static str, &'static str, Vec<(String, String)>) {
        let (service, operation, id_argument) = match service_tagging(&self.service_name) {
            Some(profile) => (profile.service, profile.list_operation, profile.id_argument),
            None => (TAGGING_API, "get-resources", "--resource-arn-list"),
        };
        let args = vec![
            (id_argument.to_string(), resource_id.to_string()),
            ("--output".to_string(), "json".to_string()),
        ];
        (service, operation, args)
    }
}

#[async_trait]
impl TagInspector for AwsCliTagInspector {
    async fn fetch_ownership_tag(&self, resource_id: &str) -> Result<TagLookup, TagLookupError> {
        let (service, operation, args) = self.lookup_command(resource_id);
        let failed = |message: String| TagLookupError::Failed {
            resource: resource_id.to_string(),
            message,
        };

        let output = AwsProcess
            .run(&self.cli, service, operation, &args)
            .await
            .map_err(|e| failed(format!("{:#}", e)))?;

        if !output.success() {
            if is_not_found(&output.stderr) {
                return Err(TagLookupError::ResourceNotFound(resource_id.to_string()));
            }
            return Err(failed(output.stderr.trim().to_string()));
        }

        let tags = parse_tag_listing(&output.stdout)
            .ok_or_else(|| failed(format!("unrecognized output from aws {} {}", service, operation)))?;
        Ok(TagLookup::from_tags(tags))
    }
}

/// Extracts key/value pairs from any of the supported list-tags outputs.
pub fn parse_tag_listing(stdout: &str) -> Option<Vec<(String, String)>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Some(Vec::new());
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;

    if let Some(mappings) = value.get("ResourceTagMappingList") {
        return match mappings.as_array()?.first() {
            Some(mapping) => tag_pairs(mapping.get("Tags").unwrap_or(&Value::Null)),
            None => Some(Vec::new()),
        };
    }
    match value.get("Tags").or_else(|| value.get("TagList")) {
        Some(tags) => tag_pairs(tags),
        None => value.is_object().then(Vec::new),
    }
}

fn tag_pairs(tags: &Value) -> Option<Vec<(String, String)>> {
    match tags {
        Value::Object(map) => Some(
            map.iter()
                .map(|(k, v)| (k.clone(), v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())))
                .collect(),
        ),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                let key = item.get("Key")?.as_str()?.to_string();
                let value = item.get("Value").and_then(Value::as_str).unwrap_or_default().to_string();
                Some((key, value))
            })
            .collect(),
        Value::Null => Some(Vec::new()),
        _ => None,
    }
}

/// Spellings of `resource_id` a CLI argument may use: the full ARN or endpoint,
/// or, for ARNs, the trailing resource name/ID.
fn accepted_identifiers(resource_id: &str) -> Vec<String> {
    let mut accepted = vec![resource_id.to_string()];
    if resource_id.starts_with("arn:") {
        if let Some(short) = resource_id.rsplit([':', '/']).next().filter(|s| !s.is_empty()) {
            accepted.push(short.to_string());
        }
    }
    accepted
}

/// Resource identifiers carried by one parameter value; empty when it is not a
/// plain string or a list of strings.
fn identifier_values(value: &Value) -> Vec<String> {
    let strings = |items: &Vec<Value>| -> Vec<String> {
        let values: Option<Vec<String>> = items.iter().map(|v| v.as_str().map(|s| s.trim().to_string())).collect();
        values.unwrap_or_default()
    };
    match value {
        Value::String(s) if s.trim_start().starts_with('[') => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => strings(&items),
            _ => Vec::new(),
        },
        Value::String(s) => vec![s.trim().to_string()],
        Value::Array(items) => strings(items),
        _ => Vec::new(),
    }
}

fn is_not_found(stderr: &str) -> bool {
    NOT_FOUND_MARKERS.iter().any(|marker| stderr.contains(marker))
}

/// Adds the ownership tag to an optional existing `tags` argument.
///
/// The existing value may be structured JSON or a JSON string; shorthand syntax
/// is not merged.
fn merge_tag_parameter(existing: Option<&Value>, shape: TagShape, tag: &OwnershipTag) -> Option<Value> {
    let existing = match existing {
        None => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(serde_json::from_str::<Value>(s).ok()?),
        Some(other) => Some(other.clone()),
    };

    match shape {
        TagShape::StringMap => {
            let mut map = match existing {
                None => serde_json::Map::new(),
                Some(Value::Object(map)) => map,
                Some(_) => return None,
            };
            map.insert(tag.key.clone(), Value::String(tag.value.clone()));
            Some(Value::Object(map))
        }
        TagShape::KeyValueList => {
            let mut items = match existing {
                None => Vec::new(),
                Some(Value::Array(items)) => items,
                Some(_) => return None,
            };
            items.retain(|item| item.get("Key").and_then(Value::as_str) != Some(tag.key.as_str()));
            items.push(serde_json::json!({ "Key": tag.key, "Value": tag.value }));
            Some(Value::Array(items))
        }
    }
}

/// First ARN quoted in a CLI JSON output; tolerant of truncated output.
fn find_arn(text: &str) -> Option<String> {
    let start = text.find("\"arn:")? + 1;
    let len = text[start..].find('"')?;
    Some(text[start..start + len].to_string())
}

fn truncate_output(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{} ... truncated", &text[..end])
}

fn user_agent_value(existing: Option<&str>) -> String {
    let metadata = format!(
        "{} {}/{}",
        USER_AGENT_APP_NAME, USER_AGENT_VERSION_KEY, USER_AGENT_VERSION_VALUE
    );
    match existing {
        Some(existing) if !existing.is_empty() => format!("{} {}", existing, metadata),
        _ => metadata,
    }
}

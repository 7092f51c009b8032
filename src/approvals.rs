//! Approval and permission arbiter
//!
//! Tracks server requests waiting on the user (approvals and user-input
//! questions) and permission denials the user may turn into "always allow"
//! rules. Decisions are answered on the original request id and the request
//! is forgotten whether or not the answer got through.

use crate::channel::SessionChannel;
use crate::events::{parse_mcp_tool_name, DeniedToolCall, DomainEvent};
use crate::model::UserInputQuestion;
use crate::{BridgeError, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Keys that may carry the command an approval is about, in priority order
const COMMAND_KEYS: &[&str] = &["argv", "command", "cmd", "commandLine", "command_line", "shellCommand"];

/// Keys naming the proposed exec-policy prefix
const AMENDMENT_KEYS: &[&str] = &[
    "proposedExecpolicyAmendment",
    "proposed_execpolicy_amendment",
    "execpolicyAmendment",
    "execpolicy_amendment",
];

/// Keys under which the real tool input may be nested
const NESTED_KEYS: &[&str] = &["input", "toolInput", "tool_input", "params", "arguments"];

const TOOL_NAME_KEYS: &[&str] = &["toolName", "tool_name", "tool", "name"];

/// Method segments that say nothing about which tool is asking
const GENERIC_SEGMENTS: &[&str] = &[
    "item",
    "items",
    "tool",
    "tools",
    "request",
    "approval",
    "requestApproval",
    "commandExecution",
    "fileChange",
    "execCommand",
    "applyPatch",
];

const MAX_NESTING: usize = 4;

/// The user's answer to an approval request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Accept,
    Decline,
    /// Accept and let the agent allow this command prefix from now on
    AcceptWithAmendment(Vec<String>),
}

impl ApprovalDecision {
    /// Response payload sent back on the request id
    pub fn to_result(&self) -> Value {
        match self {
            ApprovalDecision::Accept => json!({ "decision": "accept" }),
            ApprovalDecision::Decline => json!({ "decision": "decline" }),
            ApprovalDecision::AcceptWithAmendment(prefix) => json!({
                "decision": {
                    "acceptWithExecpolicyAmendment": {
                        "execpolicy_amendment": prefix
                    }
                }
            }),
        }
    }
}

/// An "always allow" rule and how to present it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalRule {
    pub rule: String,
    pub label: String,
}

/// A server request waiting for accept/decline
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub request_id: u64,
    pub method: String,
    pub thread_id: Option<String>,
    pub params: Value,
    pub rule: Option<ApprovalRule>,
    pub received_at: DateTime<Utc>,
}

/// A server request waiting for answers to questions
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUserInput {
    pub request_id: u64,
    pub thread_id: String,
    pub turn_id: Option<String>,
    /// Item id of the asking tool call, or the request id when absent
    pub tool_use_id: String,
    pub questions: Vec<UserInputQuestion>,
}

/// A tool call the agent already refused
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDenial {
    pub id: String,
    pub thread_id: String,
    pub turn_id: Option<String>,
    pub tool_name: String,
    pub tool_input: Value,
    pub rule: Option<ApprovalRule>,
}

/// Somewhere to send answers to server requests
pub trait ResponseSink {
    fn respond(&self, request_id: u64, result: Value) -> Result<()>;
}

impl ResponseSink for SessionChannel {
    fn respond(&self, request_id: u64, result: Value) -> Result<()> {
        SessionChannel::respond(self, request_id, result)
    }
}

/// Outstanding approvals, questions and denials of one workspace
#[derive(Debug, Default)]
pub struct ApprovalArbiter {
    approvals: Vec<ApprovalRequest>,
    user_inputs: Vec<PendingUserInput>,
    denials: Vec<PermissionDenial>,
    /// Denial ids already reported, mapped to their thread. Dismissed ids
    /// stay here until the thread's turn ends so a re-report stays hidden.
    seen_denials: HashMap<String, String>,
}

impl ApprovalArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn approvals(&self) -> &[ApprovalRequest] {
        &self.approvals
    }

    pub fn user_inputs(&self) -> &[PendingUserInput] {
        &self.user_inputs
    }

    pub fn denials(&self) -> &[PermissionDenial] {
        &self.denials
    }

    pub fn approval(&self, request_id: u64) -> Option<&ApprovalRequest> {
        self.approvals.iter().find(|request| request.request_id == request_id)
    }

    pub fn denial(&self, denial_id: &str) -> Option<&PermissionDenial> {
        self.denials.iter().find(|denial| denial.id == denial_id)
    }

    /// Track what an event asks of the user. Returns whether anything changed.
    pub fn apply(&mut self, event: &DomainEvent) -> bool {
        match event {
            DomainEvent::ApprovalRequested {
                request_id,
                method,
                thread_id,
                params,
            } => {
                if self.approval(*request_id).is_some() {
                    return false;
                }
                self.approvals.push(ApprovalRequest {
                    request_id: *request_id,
                    method: method.clone(),
                    thread_id: thread_id.clone(),
                    params: params.clone(),
                    rule: derive_rule(params, method),
                    received_at: Utc::now(),
                });
                true
            }
            DomainEvent::UserInputRequested {
                request_id,
                thread_id,
                turn_id,
                item_id,
                questions,
            } => {
                if self.user_inputs.iter().any(|input| input.request_id == *request_id) {
                    return false;
                }
                self.user_inputs.push(PendingUserInput {
                    request_id: *request_id,
                    thread_id: thread_id.clone(),
                    turn_id: turn_id.clone(),
                    tool_use_id: item_id.clone().unwrap_or_else(|| request_id.to_string()),
                    questions: questions.clone(),
                });
                true
            }
            DomainEvent::PermissionDenied {
                thread_id,
                turn_id,
                denials,
            } => self.record_denials(thread_id, turn_id.as_deref(), denials),
            DomainEvent::TurnCompleted { thread_id, .. } => {
                self.forget_dismissed(Some(thread_id));
                self.expire_thread(thread_id) > 0
            }
            DomainEvent::ChannelClosed { .. } => {
                let changed = !self.approvals.is_empty() || !self.user_inputs.is_empty();
                self.approvals.clear();
                self.user_inputs.clear();
                self.forget_dismissed(None);
                changed
            }
            _ => false,
        }
    }

    fn record_denials(&mut self, thread_id: &str, turn_id: Option<&str>, denials: &[DeniedToolCall]) -> bool {
        let mut changed = false;
        for (idx, denied) in denials.iter().enumerate() {
            let id = denied
                .tool_use_id
                .clone()
                .unwrap_or_else(|| format!("{}-{}-{}", thread_id, denied.tool_name, idx));
            if self.seen_denials.contains_key(&id) {
                continue;
            }
            self.seen_denials.insert(id.clone(), thread_id.to_string());
            self.denials.push(PermissionDenial {
                id,
                thread_id: thread_id.to_string(),
                turn_id: turn_id.map(str::to_string),
                tool_name: denied.tool_name.clone(),
                tool_input: denied.tool_input.clone(),
                rule: denial_rule(&denied.tool_name, &denied.tool_input),
            });
            changed = true;
        }
        changed
    }

    /// Drop de-duplication entries of dismissed denials, for one thread or
    /// for all of them. Denials still shown keep theirs.
    fn forget_dismissed(&mut self, thread_id: Option<&str>) {
        let shown: HashSet<&str> = self.denials.iter().map(|denial| denial.id.as_str()).collect();
        self.seen_denials.retain(|id, owner| {
            shown.contains(id.as_str()) || thread_id.is_some_and(|thread_id| owner != thread_id)
        });
    }

    /// Forget requests owned by a thread whose turn ended. Returns how many
    /// were dropped.
    pub fn expire_thread(&mut self, thread_id: &str) -> usize {
        let before = self.approvals.len() + self.user_inputs.len();
        self.approvals
            .retain(|request| request.thread_id.as_deref() != Some(thread_id));
        self.user_inputs.retain(|input| input.thread_id != thread_id);
        let dropped = before - (self.approvals.len() + self.user_inputs.len());
        if dropped > 0 {
            debug!("Expired {} pending requests for thread {}", dropped, thread_id);
        }
        dropped
    }

    /// Send the decision for `request_id` and drop the request. The request
    /// is dropped even when the send fails.
    pub fn decide(&mut self, sink: &impl ResponseSink, request_id: u64, decision: &ApprovalDecision) -> Result<()> {
        let Some(position) = self
            .approvals
            .iter()
            .position(|request| request.request_id == request_id)
        else {
            return Err(BridgeError::InvalidArgument(format!(
                "no pending approval with id {request_id}"
            )));
        };
        let request = self.approvals.remove(position);
        info!("Approval {} ({}): {:?}", request_id, request.method, decision);
        sink.respond(request_id, decision.to_result())
            .map_err(|e| {
                warn!("Approval {} answer not delivered: {}", request_id, e);
                BridgeError::ApprovalSend {
                    request_id,
                    reason: e.to_string(),
                }
            })
    }

    /// Answer a pending user-input request, found by thread and tool-use id.
    pub fn answer_user_input(
        &mut self,
        sink: &impl ResponseSink,
        thread_id: &str,
        tool_use_id: &str,
        answers: &HashMap<String, Vec<String>>,
    ) -> Result<()> {
        let Some(position) = self
            .user_inputs
            .iter()
            .position(|input| input.thread_id == thread_id && input.tool_use_id == tool_use_id)
        else {
            return Err(BridgeError::InvalidArgument(format!(
                "no pending question {tool_use_id} in thread {thread_id}"
            )));
        };
        let input = self.user_inputs.remove(position);
        let answers: Map<String, Value> = answers
            .iter()
            .map(|(id, values)| (id.clone(), json!({ "answers": values })))
            .collect();
        sink.respond(input.request_id, json!({ "answers": answers }))
            .map_err(|e| BridgeError::ApprovalSend {
                request_id: input.request_id,
                reason: e.to_string(),
            })
    }

    pub fn dismiss_denial(&mut self, denial_id: &str) -> Option<PermissionDenial> {
        let position = self.denials.iter().position(|denial| denial.id == denial_id)?;
        Some(self.denials.remove(position))
    }
}

/// Derive an "always allow" rule for an approval request: a command-prefix
/// rule when a command can be found, else a rule for the tool by name.
pub fn derive_rule(params: &Value, method: &str) -> Option<ApprovalRule> {
    if let Some(tokens) = find_command(params, 0) {
        return command_rule(&tokens);
    }
    let tool = find_tool_name(params, 0).or_else(|| tool_from_method(method))?;
    Some(tool_rule(&tool))
}

fn denial_rule(tool_name: &str, input: &Value) -> Option<ApprovalRule> {
    if tool_name.eq_ignore_ascii_case("bash") {
        if let Some(rule) = find_command(input, 0).and_then(|tokens| command_rule(&tokens)) {
            return Some(rule);
        }
    }
    if tool_name.trim().is_empty() {
        return None;
    }
    Some(tool_rule(tool_name.trim()))
}

fn command_rule(tokens: &[String]) -> Option<ApprovalRule> {
    let joined = shell_words::join(tokens);
    if joined.trim().is_empty() {
        return None;
    }
    Some(ApprovalRule {
        rule: format!("Bash({joined}:*)"),
        label: format!("commands starting with `{joined}`"),
    })
}

fn tool_rule(tool: &str) -> ApprovalRule {
    let label = match parse_mcp_tool_name(tool) {
        Some((server, name)) => format!("{server} / {name}"),
        None => tool.to_string(),
    };
    ApprovalRule {
        rule: tool.to_string(),
        label: format!("all {label} calls"),
    }
}

fn find_command(value: &Value, depth: usize) -> Option<Vec<String>> {
    if depth > MAX_NESTING {
        return None;
    }
    let map = value.as_object()?;
    for key in COMMAND_KEYS.iter().chain(AMENDMENT_KEYS) {
        if let Some(tokens) = map.get(*key).and_then(command_tokens) {
            return Some(tokens);
        }
    }
    NESTED_KEYS
        .iter()
        .filter_map(|key| map.get(*key))
        .find_map(|nested| find_command(nested, depth + 1))
}

/// Tokens of a command given as argv or as a shell string. A
/// `bash -lc "<script>"` wrapper is unwrapped to the script's own tokens.
fn command_tokens(value: &Value) -> Option<Vec<String>> {
    let tokens: Vec<String> = match value {
        Value::Array(parts) => parts
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect(),
        Value::String(line) => split_command(line),
        Value::Object(_) => value
            .get("command")
            .or_else(|| value.get("prefix"))
            .and_then(command_tokens)?,
        _ => return None,
    };
    let tokens = unwrap_shell(tokens);
    if tokens.is_empty() {
        None
    } else {
        Some(tokens)
    }
}

fn split_command(line: &str) -> Vec<String> {
    match shell_words::split(line) {
        Ok(tokens) => tokens,
        Err(e) => {
            debug!("Unbalanced quoting in {:?}: {}", line, e);
            line.split_whitespace().map(str::to_string).collect()
        }
    }
}

fn unwrap_shell(tokens: Vec<String>) -> Vec<String> {
    let is_shell = tokens.first().is_some_and(|first| {
        let name = first.rsplit('/').next().unwrap_or(first);
        matches!(name, "bash" | "sh" | "zsh")
    });
    if is_shell && tokens.len() == 3 && matches!(tokens[1].as_str(), "-c" | "-lc") {
        return split_command(&tokens[2]);
    }
    tokens
}

fn find_tool_name(value: &Value, depth: usize) -> Option<String> {
    if depth > MAX_NESTING {
        return None;
    }
    let map = value.as_object()?;
    let direct = TOOL_NAME_KEYS
        .iter()
        .filter_map(|key| map.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|name| !name.is_empty())
        .map(str::to_string);
    direct.or_else(|| {
        NESTED_KEYS
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(|nested| find_tool_name(nested, depth + 1))
    })
}

fn tool_from_method(method: &str) -> Option<String> {
    let segments: Vec<&str> = method.split('/').filter(|segment| !segment.is_empty()).collect();
    if segments.len() < 2 {
        return None;
    }
    let candidate = segments[segments.len() - 2];
    if GENERIC_SEGMENTS.contains(&candidate) {
        return None;
    }
    Some(candidate.to_string())
}

/// Persistent store for "always allow" rules
pub trait RuleStore: Send + Sync {
    /// Record `rule`. Resolves to `false` when it was already present.
    fn remember<'a>(&'a self, rule: &'a str) -> BoxFuture<'a, Result<bool>>;

    fn rules(&self) -> BoxFuture<'_, Result<Vec<String>>>;
}

/// Rules kept in the `permissions.allow` array of a JSON settings file
#[derive(Debug, Clone)]
pub struct SettingsRuleStore {
    path: PathBuf,
}

impl SettingsRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<workspace>/.claude/settings.local.json`
    pub fn for_workspace(workspace_path: &Path) -> Self {
        Self::new(workspace_path.join(".claude").join("settings.local.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_settings(&self) -> Result<Map<String, Value>> {
        if !fs::try_exists(&self.path).await? {
            return Ok(Map::new());
        }
        let content = fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&content)? {
            Value::Object(map) => Ok(map),
            _ => {
                warn!("{} is not a JSON object; starting fresh", self.path.display());
                Ok(Map::new())
            }
        }
    }

    async fn write_settings(&self, settings: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, content).await?;
        Ok(())
    }

    async fn remember_rule(&self, rule: &str) -> Result<bool> {
        let rule = rule.trim();
        if rule.is_empty() {
            return Err(BridgeError::InvalidArgument("empty rule".to_string()));
        }
        let mut settings = self.read_settings().await?;
        let permissions = settings
            .entry("permissions")
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .ok_or_else(|| BridgeError::Config("`permissions` is not an object".to_string()))?;
        let allow = permissions
            .entry("allow")
            .or_insert_with(|| json!([]))
            .as_array_mut()
            .ok_or_else(|| BridgeError::Config("`permissions.allow` is not an array".to_string()))?;
        if allow.iter().any(|existing| existing.as_str() == Some(rule)) {
            return Ok(false);
        }
        allow.push(Value::String(rule.to_string()));
        self.write_settings(&settings).await?;
        info!("Remembered rule {} in {}", rule, self.path.display());
        Ok(true)
    }

    async fn allowed_rules(&self) -> Result<Vec<String>> {
        let settings = self.read_settings().await?;
        Ok(settings
            .get("permissions")
            .and_then(|permissions| permissions.get("allow"))
            .and_then(Value::as_array)
            .map(|allow| {
                allow
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl RuleStore for SettingsRuleStore {
    fn remember<'a>(&'a self, rule: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(self.remember_rule(rule))
    }

    fn rules(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(self.allowed_rules())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(u64, Value)>>,
        fail: bool,
    }

    impl ResponseSink for RecordingSink {
        fn respond(&self, request_id: u64, result: Value) -> Result<()> {
            if self.fail {
                return Err(BridgeError::ChannelClosed);
            }
            self.sent.lock().unwrap().push((request_id, result));
            Ok(())
        }
    }

    fn approval_event(request_id: u64, thread_id: &str, params: Value) -> DomainEvent {
        DomainEvent::ApprovalRequested {
            request_id,
            method: "item/commandExecution/requestApproval".to_string(),
            thread_id: Some(thread_id.to_string()),
            params,
        }
    }

    #[test]
    fn test_command_rule() {
        let rule = derive_rule(&json!({"command": "git push origin main"}), "item/commandExecution/requestApproval");
        assert_eq!(rule.unwrap().rule, "Bash(git push origin main:*)");
    }

    #[test]
    fn test_no_rule_without_command_or_tool() {
        assert_eq!(derive_rule(&json!({"reason": "why not"}), "item/commandExecution/requestApproval"), None);
        assert_eq!(derive_rule(&json!({}), "requestApproval"), None);
    }

    #[test]
    fn test_rule_handles_quoting_and_argv() {
        let quoted = derive_rule(&json!({"cmd": "echo 'hello world' \"a\\\"b\""}), "x").unwrap();
        assert_eq!(quoted.rule, "Bash(echo 'hello world' 'a\"b':*)");

        let argv = derive_rule(&json!({"argv": ["ls", "-la"]}), "x").unwrap();
        assert_eq!(argv.rule, "Bash(ls -la:*)");

        let wrapped = derive_rule(&json!({"command": ["/bin/bash", "-lc", "cargo test --all"]}), "x").unwrap();
        assert_eq!(wrapped.rule, "Bash(cargo test --all:*)");
    }

    #[test]
    fn test_rule_from_nested_input_and_amendment() {
        let nested = derive_rule(&json!({"toolInput": {"input": {"command": "npm run build"}}}), "x").unwrap();
        assert_eq!(nested.rule, "Bash(npm run build:*)");

        let amendment = derive_rule(
            &json!({"threadId": "t", "proposedExecpolicyAmendment": ["cargo", "build"]}),
            "item/commandExecution/requestApproval",
        )
        .unwrap();
        assert_eq!(amendment.rule, "Bash(cargo build:*)");
    }

    #[test]
    fn test_tool_rule_from_params_or_method() {
        let named = derive_rule(&json!({"toolName": "mcp__github__create_issue"}), "x").unwrap();
        assert_eq!(named.rule, "mcp__github__create_issue");
        assert_eq!(named.label, "all github / create_issue calls");

        let from_method = derive_rule(&json!({}), "item/webFetch/requestApproval").unwrap();
        assert_eq!(from_method.rule, "webFetch");
    }

    #[test]
    fn test_decide_removes_even_when_send_fails() {
        let mut arbiter = ApprovalArbiter::new();
        arbiter.apply(&approval_event(5, "t1", json!({"command": "rm -rf build"})));
        assert_eq!(arbiter.approvals().len(), 1);

        let sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let err = arbiter.decide(&sink, 5, &ApprovalDecision::Accept).unwrap_err();
        assert!(matches!(err, BridgeError::ApprovalSend { request_id: 5, .. }));
        assert!(arbiter.approvals().is_empty());
    }

    #[test]
    fn test_decide_sends_on_request_id() {
        let mut arbiter = ApprovalArbiter::new();
        arbiter.apply(&approval_event(9, "t1", json!({})));
        let sink = RecordingSink::default();
        arbiter
            .decide(&sink, 9, &ApprovalDecision::AcceptWithAmendment(vec!["git".to_string()]))
            .unwrap();
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0].0, 9);
        assert_eq!(
            sent[0].1["decision"]["acceptWithExecpolicyAmendment"]["execpolicy_amendment"],
            json!(["git"])
        );
        assert!(matches!(
            arbiter.decide(&sink, 9, &ApprovalDecision::Decline),
            Err(BridgeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_turn_end_expires_requests() {
        let mut arbiter = ApprovalArbiter::new();
        arbiter.apply(&approval_event(1, "t1", json!({})));
        arbiter.apply(&approval_event(2, "t2", json!({})));
        arbiter.apply(&DomainEvent::TurnCompleted {
            thread_id: "t1".to_string(),
            turn_id: None,
            error: None,
        });
        let remaining: Vec<u64> = arbiter.approvals().iter().map(|r| r.request_id).collect();
        assert_eq!(remaining, vec![2]);

        arbiter.apply(&DomainEvent::ChannelClosed {
            reason: "exit".to_string(),
        });
        assert!(arbiter.approvals().is_empty());
    }

    #[test]
    fn test_denials_are_recorded_once() {
        let mut arbiter = ApprovalArbiter::new();
        let event = DomainEvent::PermissionDenied {
            thread_id: "t1".to_string(),
            turn_id: None,
            denials: vec![
                DeniedToolCall {
                    tool_name: "Bash".to_string(),
                    tool_use_id: Some("toolu_1".to_string()),
                    tool_input: json!({"command": "git push"}),
                },
                DeniedToolCall {
                    tool_name: "WebFetch".to_string(),
                    tool_use_id: None,
                    tool_input: json!({"url": "https://example.com"}),
                },
            ],
        };
        assert!(arbiter.apply(&event));
        assert!(!arbiter.apply(&event));
        let denials = arbiter.denials();
        assert_eq!(denials.len(), 2);
        assert_eq!(denials[0].rule.as_ref().unwrap().rule, "Bash(git push:*)");
        assert_eq!(denials[1].id, "t1-WebFetch-1");
        assert_eq!(denials[1].rule.as_ref().unwrap().rule, "WebFetch");

        assert!(arbiter.dismiss_denial("toolu_1").is_some());
        assert_eq!(arbiter.denials().len(), 1);
        // Dismissed denials do not come back when re-reported.
        arbiter.apply(&event);
        assert_eq!(arbiter.denials().len(), 1);
    }

    #[test]
    fn test_dismissed_denials_are_forgotten_after_the_turn() {
        let mut arbiter = ApprovalArbiter::new();
        let denied = |thread: &str, tool_use: &str| DomainEvent::PermissionDenied {
            thread_id: thread.to_string(),
            turn_id: None,
            denials: vec![DeniedToolCall {
                tool_name: "Bash".to_string(),
                tool_use_id: Some(tool_use.to_string()),
                tool_input: json!({"command": "git push"}),
            }],
        };
        arbiter.apply(&denied("t1", "toolu_1"));
        arbiter.apply(&denied("t2", "toolu_2"));
        arbiter.apply(&denied("t2", "toolu_3"));
        arbiter.dismiss_denial("toolu_1");
        arbiter.dismiss_denial("toolu_2");
        assert_eq!(arbiter.seen_denials.len(), 3);

        arbiter.apply(&DomainEvent::TurnCompleted {
            thread_id: "t1".to_string(),
            turn_id: None,
            error: None,
        });
        let mut seen: Vec<&str> = arbiter.seen_denials.keys().map(String::as_str).collect();
        seen.sort();
        assert_eq!(seen, vec!["toolu_2", "toolu_3"]);

        arbiter.apply(&DomainEvent::ChannelClosed {
            reason: "exit".to_string(),
        });
        let seen: Vec<&str> = arbiter.seen_denials.keys().map(String::as_str).collect();
        assert_eq!(seen, vec!["toolu_3"]);
        assert_eq!(arbiter.denials().len(), 1);
    }

    #[test]
    fn test_user_input_answer_payload() {
        let mut arbiter = ApprovalArbiter::new();
        arbiter.apply(&DomainEvent::UserInputRequested {
            request_id: 11,
            thread_id: "t1".to_string(),
            turn_id: None,
            item_id: Some("call_1".to_string()),
            questions: Vec::new(),
        });
        let sink = RecordingSink::default();
        let answers = HashMap::from([("scope".to_string(), vec!["All".to_string()])]);
        arbiter.answer_user_input(&sink, "t1", "call_1", &answers).unwrap();
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0], (11, json!({"answers": {"scope": {"answers": ["All"]}}})));
        assert!(arbiter.user_inputs().is_empty());
    }

    #[tokio::test]
    async fn test_settings_store_appends_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let store = SettingsRuleStore::for_workspace(dir.path());
        assert!(store.remember("Bash(git push:*)").await.unwrap());
        assert!(!store.remember("Bash(git push:*)").await.unwrap());
        assert!(store.remember("WebFetch").await.unwrap());
        assert_eq!(
            store.rules().await.unwrap(),
            vec!["Bash(git push:*)".to_string(), "WebFetch".to_string()]
        );
        assert!(matches!(store.remember("  ").await, Err(BridgeError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_settings_store_keeps_other_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"model": "opus", "permissions": {"deny": ["Read"]}}"#).unwrap();
        let store = SettingsRuleStore::new(&path);
        store.remember("Edit").await.unwrap();
        let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["model"], "opus");
        assert_eq!(saved["permissions"]["deny"], json!(["Read"]));
        assert_eq!(saved["permissions"]["allow"], json!(["Edit"]));
    }
}

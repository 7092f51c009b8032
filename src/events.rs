//! Event demultiplexer
//!
//! `classify` is the only place that looks at raw notification shapes. Field
//! names are accepted in camelCase and snake_case; an event missing a field
//! it cannot do without is logged and dropped.

use crate::model::{
    FileChange, ItemId, PlanStep, ReviewState, StepStatus, ThreadItem, TokenUsage, ToolStatus,
    UserInputOption, UserInputQuestion,
};
use crate::protocol::{notifications, IncomingMessage};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// A tool call the agent refused under its static policy
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeniedToolCall {
    pub tool_name: String,
    pub tool_use_id: Option<String>,
    pub tool_input: Value,
}

/// Typed domain events, one variant per recognized method
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DomainEvent {
    ConnectionEstablished,
    ApprovalRequested {
        request_id: u64,
        method: String,
        thread_id: Option<String>,
        params: Value,
    },
    UserInputRequested {
        request_id: u64,
        thread_id: String,
        turn_id: Option<String>,
        item_id: Option<String>,
        questions: Vec<UserInputQuestion>,
    },
    AgentMessageDelta {
        thread_id: String,
        item_id: String,
        delta: String,
    },
    AgentMessageStarted {
        thread_id: String,
        item_id: String,
    },
    AgentMessageCompleted {
        thread_id: String,
        item_id: String,
        text: String,
    },
    ItemStarted {
        thread_id: String,
        item: ThreadItem,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        spawned_threads: Vec<String>,
    },
    ItemCompleted {
        thread_id: String,
        item: ThreadItem,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        spawned_threads: Vec<String>,
    },
    TurnStarted {
        thread_id: String,
        turn_id: Option<String>,
    },
    TurnCompleted {
        thread_id: String,
        turn_id: Option<String>,
        error: Option<String>,
    },
    TurnPlanUpdated {
        thread_id: String,
        turn_id: Option<String>,
        explanation: Option<String>,
        plan: Vec<PlanStep>,
    },
    TurnDiffUpdated {
        thread_id: String,
        diff: String,
    },
    PermissionDenied {
        thread_id: String,
        turn_id: Option<String>,
        denials: Vec<DeniedToolCall>,
    },
    TurnError {
        thread_id: String,
        turn_id: Option<String>,
        message: String,
        will_retry: bool,
    },
    ThreadCreated {
        thread_id: String,
        parent_id: Option<String>,
        name: Option<String>,
    },
    ThreadNameUpdated {
        thread_id: String,
        name: Option<String>,
    },
    ThreadCompacted {
        thread_id: String,
        turn_id: Option<String>,
    },
    TokenUsageUpdated {
        thread_id: String,
        usage: TokenUsage,
    },
    ReasoningSummaryDelta {
        thread_id: String,
        item_id: String,
        delta: String,
    },
    ReasoningSummaryBoundary {
        thread_id: String,
        item_id: String,
    },
    ReasoningTextDelta {
        thread_id: String,
        item_id: String,
        delta: String,
    },
    CommandOutputDelta {
        thread_id: String,
        item_id: String,
        delta: String,
    },
    TerminalInteraction {
        thread_id: String,
        item_id: String,
        stdin: String,
    },
    FileChangeOutputDelta {
        thread_id: String,
        item_id: String,
        delta: String,
    },
    /// The agent process went away; emitted by the workspace, never classified
    ChannelClosed {
        reason: String,
    },
    /// Recognized as well-formed but not part of the domain; no state changes
    Passthrough {
        method: String,
        request_id: Option<u64>,
        params: Value,
    },
}

impl DomainEvent {
    /// Thread the event belongs to, when it names one
    pub fn thread_id(&self) -> Option<&str> {
        match self {
            DomainEvent::ApprovalRequested { thread_id, .. } => thread_id.as_deref(),
            DomainEvent::UserInputRequested { thread_id, .. }
            | DomainEvent::AgentMessageDelta { thread_id, .. }
            | DomainEvent::AgentMessageStarted { thread_id, .. }
            | DomainEvent::AgentMessageCompleted { thread_id, .. }
            | DomainEvent::ItemStarted { thread_id, .. }
            | DomainEvent::ItemCompleted { thread_id, .. }
            | DomainEvent::TurnStarted { thread_id, .. }
            | DomainEvent::TurnCompleted { thread_id, .. }
            | DomainEvent::TurnPlanUpdated { thread_id, .. }
            | DomainEvent::TurnDiffUpdated { thread_id, .. }
            | DomainEvent::PermissionDenied { thread_id, .. }
            | DomainEvent::TurnError { thread_id, .. }
            | DomainEvent::ThreadCreated { thread_id, .. }
            | DomainEvent::ThreadNameUpdated { thread_id, .. }
            | DomainEvent::ThreadCompacted { thread_id, .. }
            | DomainEvent::TokenUsageUpdated { thread_id, .. }
            | DomainEvent::ReasoningSummaryDelta { thread_id, .. }
            | DomainEvent::ReasoningSummaryBoundary { thread_id, .. }
            | DomainEvent::ReasoningTextDelta { thread_id, .. }
            | DomainEvent::CommandOutputDelta { thread_id, .. }
            | DomainEvent::TerminalInteraction { thread_id, .. }
            | DomainEvent::FileChangeOutputDelta { thread_id, .. } => Some(thread_id),
            DomainEvent::ConnectionEstablished
            | DomainEvent::ChannelClosed { .. }
            | DomainEvent::Passthrough { .. } => None,
        }
    }
}

/// Classify one inbound message. Responses and events missing required
/// fields yield `None`.
pub fn classify(message: &IncomingMessage) -> Option<DomainEvent> {
    let (method, params, request_id) = match message {
        IncomingMessage::Request { id, method, params } => (method.as_str(), params, Some(*id)),
        IncomingMessage::Notification { method, params } => (method.as_str(), params, None),
        IncomingMessage::Response { .. } => return None,
    };

    if let Some(request_id) = request_id {
        if method.ends_with(notifications::APPROVAL_SUFFIX) {
            return Some(DomainEvent::ApprovalRequested {
                request_id,
                method: method.to_string(),
                thread_id: thread_id(params),
                params: params.clone(),
            });
        }
        if method == notifications::REQUEST_USER_INPUT {
            return Some(DomainEvent::UserInputRequested {
                request_id,
                thread_id: required(thread_id(params), method, "thread id")?,
                turn_id: turn_id(params),
                item_id: item_id(params),
                questions: parse_questions(params),
            });
        }
        return Some(passthrough(method, Some(request_id), params));
    }

    let event = match method {
        notifications::CONNECTED => DomainEvent::ConnectionEstablished,
        notifications::ITEM_AGENT_MESSAGE_DELTA => DomainEvent::AgentMessageDelta {
            thread_id: required(thread_id(params), method, "thread id")?,
            item_id: required(item_id(params), method, "item id")?,
            delta: required(raw_text(params, &["delta"]), method, "delta")?,
        },
        notifications::ITEM_STARTED | notifications::ITEM_COMPLETED => {
            return classify_item(method, params);
        }
        notifications::TURN_STARTED => DomainEvent::TurnStarted {
            thread_id: required(thread_id(params), method, "thread id")?,
            turn_id: turn_id(params),
        },
        notifications::TURN_COMPLETED => DomainEvent::TurnCompleted {
            thread_id: required(thread_id(params), method, "thread id")?,
            turn_id: turn_id(params),
            error: params
                .get("turn")
                .and_then(|turn| turn.get("error"))
                .or_else(|| params.get("error"))
                .and_then(error_message),
        },
        notifications::TURN_PLAN_UPDATED => DomainEvent::TurnPlanUpdated {
            thread_id: required(thread_id(params), method, "thread id")?,
            turn_id: turn_id(params),
            explanation: text(params, &["explanation"]),
            plan: parse_plan(params),
        },
        notifications::TURN_DIFF_UPDATED => DomainEvent::TurnDiffUpdated {
            thread_id: required(thread_id(params), method, "thread id")?,
            diff: required(raw_text(params, &["diff", "unifiedDiff", "unified_diff"]), method, "diff")?,
        },
        notifications::TURN_PERMISSION_DENIED => DomainEvent::PermissionDenied {
            thread_id: required(thread_id(params), method, "thread id")?,
            turn_id: turn_id(params),
            denials: parse_denials(params),
        },
        notifications::THREAD_STARTED | notifications::THREAD_CREATED => {
            let thread = params.get("thread").unwrap_or(params);
            DomainEvent::ThreadCreated {
                thread_id: required(
                    text(thread, &["id"]).or_else(|| thread_id(params)),
                    method,
                    "thread id",
                )?,
                parent_id: text(thread, &["parentId", "parent_id", "parentThreadId", "parent_thread_id"])
                    .or_else(|| text(params, &["parentId", "parent_id", "parentThreadId"])),
                name: text(thread, &["name", "threadName", "thread_name"]),
            }
        }
        notifications::THREAD_NAME_UPDATED => DomainEvent::ThreadNameUpdated {
            thread_id: required(thread_id(params), method, "thread id")?,
            name: text(params, &["threadName", "thread_name", "name"]),
        },
        notifications::THREAD_COMPACTED => DomainEvent::ThreadCompacted {
            thread_id: required(thread_id(params), method, "thread id")?,
            turn_id: turn_id(params),
        },
        notifications::THREAD_TOKEN_USAGE_UPDATED => DomainEvent::TokenUsageUpdated {
            thread_id: required(thread_id(params), method, "thread id")?,
            usage: required(
                field(params, &["tokenUsage", "token_usage", "usage"]).and_then(TokenUsage::from_value),
                method,
                "token usage",
            )?,
        },
        notifications::REASONING_SUMMARY_TEXT_DELTA => DomainEvent::ReasoningSummaryDelta {
            thread_id: required(thread_id(params), method, "thread id")?,
            item_id: required(item_id(params), method, "item id")?,
            delta: required(raw_text(params, &["delta"]), method, "delta")?,
        },
        notifications::REASONING_SUMMARY_PART_ADDED => DomainEvent::ReasoningSummaryBoundary {
            thread_id: required(thread_id(params), method, "thread id")?,
            item_id: required(item_id(params), method, "item id")?,
        },
        notifications::REASONING_TEXT_DELTA => DomainEvent::ReasoningTextDelta {
            thread_id: required(thread_id(params), method, "thread id")?,
            item_id: required(item_id(params), method, "item id")?,
            delta: required(raw_text(params, &["delta"]), method, "delta")?,
        },
        notifications::COMMAND_EXEC_OUTPUT_DELTA => DomainEvent::CommandOutputDelta {
            thread_id: required(thread_id(params), method, "thread id")?,
            item_id: required(item_id(params), method, "item id")?,
            delta: required(raw_text(params, &["delta"]), method, "delta")?,
        },
        notifications::TERMINAL_INTERACTION => DomainEvent::TerminalInteraction {
            thread_id: required(thread_id(params), method, "thread id")?,
            item_id: required(item_id(params), method, "item id")?,
            stdin: raw_text(params, &["stdin"]).unwrap_or_default(),
        },
        notifications::FILE_CHANGE_OUTPUT_DELTA => DomainEvent::FileChangeOutputDelta {
            thread_id: required(thread_id(params), method, "thread id")?,
            item_id: required(item_id(params), method, "item id")?,
            delta: required(raw_text(params, &["delta"]), method, "delta")?,
        },
        notifications::ERROR => DomainEvent::TurnError {
            thread_id: required(thread_id(params), method, "thread id")?,
            turn_id: turn_id(params),
            message: params
                .get("error")
                .and_then(error_message)
                .or_else(|| text(params, &["message"]))
                .unwrap_or_else(|| "Unknown error".to_string()),
            will_retry: field(params, &["willRetry", "will_retry"])
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        _ => passthrough(method, None, params),
    };
    Some(event)
}

fn classify_item(method: &str, params: &Value) -> Option<DomainEvent> {
    let thread_id = required(thread_id(params), method, "thread id")?;
    let raw_item = required(params.get("item"), method, "item")?;
    let started = method == notifications::ITEM_STARTED;

    if item_type(raw_item) == Some("agentMessage") {
        let item_id = required(text(raw_item, &["id"]), method, "item id")?;
        return Some(if started {
            DomainEvent::AgentMessageStarted { thread_id, item_id }
        } else {
            DomainEvent::AgentMessageCompleted {
                thread_id,
                item_id,
                text: raw_text(raw_item, &["text"]).unwrap_or_default(),
            }
        });
    }

    let Some(item) = parse_thread_item(raw_item) else {
        // Item types without a display form still count as well-formed.
        return Some(passthrough(method, None, params));
    };
    let spawned_threads = spawned_threads(raw_item);
    Some(if started {
        DomainEvent::ItemStarted {
            thread_id,
            item,
            spawned_threads,
        }
    } else {
        DomainEvent::ItemCompleted {
            thread_id,
            item,
            spawned_threads,
        }
    })
}

fn passthrough(method: &str, request_id: Option<u64>, params: &Value) -> DomainEvent {
    DomainEvent::Passthrough {
        method: method.to_string(),
        request_id,
        params: params.clone(),
    }
}

fn required<T>(value: Option<T>, method: &str, what: &str) -> Option<T> {
    if value.is_none() {
        warn!("Dropping {} event without {}", method, what);
    }
    value
}

/// First present value among `keys`
pub(crate) fn field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| value.get(*key))
        .filter(|value| !value.is_null())
}

/// First non-blank string among `keys`, trimmed
pub(crate) fn text(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(str::to_string)
}

/// First string among `keys`, verbatim (deltas keep their whitespace)
fn raw_text(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn thread_id(params: &Value) -> Option<String> {
    text(params, &["threadId", "thread_id", "conversationId"])
        .or_else(|| params.get("thread").and_then(|thread| text(thread, &["id"])))
        .or_else(|| params.get("turn").and_then(|turn| text(turn, &["threadId", "thread_id"])))
}

fn turn_id(params: &Value) -> Option<String> {
    text(params, &["turnId", "turn_id"])
        .or_else(|| params.get("turn").and_then(|turn| text(turn, &["id"])))
}

fn item_id(params: &Value) -> Option<String> {
    text(params, &["itemId", "item_id"])
        .or_else(|| params.get("item").and_then(|item| text(item, &["id"])))
}

fn error_message(error: &Value) -> Option<String> {
    match error {
        Value::String(message) if !message.trim().is_empty() => Some(message.trim().to_string()),
        Value::Object(_) => text(error, &["message", "detail", "details"]),
        _ => None,
    }
}

fn item_type(item: &Value) -> Option<&str> {
    item.get("type").and_then(Value::as_str)
}

fn parse_plan(params: &Value) -> Vec<PlanStep> {
    let Some(steps) = field(params, &["plan", "steps"]).and_then(Value::as_array) else {
        return Vec::new();
    };
    steps
        .iter()
        .filter_map(|step| {
            let label = text(step, &["step", "title", "text"])?;
            let status = text(step, &["status"]).map(|s| StepStatus::parse(&s)).unwrap_or(StepStatus::Pending);
            Some(PlanStep { step: label, status })
        })
        .collect()
}

fn parse_denials(params: &Value) -> Vec<DeniedToolCall> {
    let Some(entries) = field(params, &["denials", "permissionDenials", "permission_denials"])
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            Some(DeniedToolCall {
                tool_name: text(entry, &["toolName", "tool_name", "tool"])?,
                tool_use_id: text(entry, &["toolUseId", "tool_use_id", "id"]),
                tool_input: field(entry, &["toolInput", "tool_input", "input"])
                    .cloned()
                    .unwrap_or(Value::Null),
            })
        })
        .collect()
}

fn parse_questions(params: &Value) -> Vec<UserInputQuestion> {
    if let Some(questions) = params.get("questions").and_then(Value::as_array) {
        return questions
            .iter()
            .enumerate()
            .filter_map(|(idx, raw)| {
                let question = text(raw, &["question", "text", "prompt"])?;
                Some(UserInputQuestion {
                    id: text(raw, &["id"]).unwrap_or_else(|| format!("q{idx}")),
                    header: text(raw, &["header"]).unwrap_or_default(),
                    question,
                    options: parse_options(raw),
                })
            })
            .collect();
    }
    // Older agents send a single bare question.
    text(params, &["question", "prompt"])
        .map(|question| {
            vec![UserInputQuestion {
                id: "q0".to_string(),
                header: String::new(),
                question,
                options: parse_options(params),
            }]
        })
        .unwrap_or_default()
}

fn parse_options(raw: &Value) -> Vec<UserInputOption> {
    raw.get("options")
        .and_then(Value::as_array)
        .map(|options| {
            options
                .iter()
                .filter_map(|option| match option {
                    Value::String(label) => Some(UserInputOption {
                        label: label.clone(),
                        description: String::new(),
                    }),
                    _ => Some(UserInputOption {
                        label: text(option, &["label", "value"])?,
                        description: text(option, &["description"]).unwrap_or_default(),
                    }),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Split `mcp__<server>__<tool>` into its parts.
pub fn parse_mcp_tool_name(name: &str) -> Option<(String, String)> {
    let trimmed = name.trim();
    if !trimmed.to_ascii_lowercase().starts_with("mcp__") {
        return None;
    }
    let mut parts = trimmed.splitn(3, "__").skip(1);
    let server = parts.next()?.trim();
    let tool = parts.next()?.trim();
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server.to_string(), tool.to_string()))
}

/// Thread ids a sub-agent tool call spawned, if any
pub fn spawned_threads(item: &Value) -> Vec<String> {
    if !matches!(item_type(item), Some("collabAgentToolCall" | "collabToolCall")) {
        return Vec::new();
    }
    let details = item.get("details").unwrap_or(item);
    let mut ids: Vec<String> = field(details, &["receiverThreadIds", "receiver_thread_ids"])
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if let Some(single) = text(details, &["receiverThreadId", "receiver_thread_id", "newThreadId"]) {
        if !ids.contains(&single) {
            ids.push(single);
        }
    }
    ids
}

fn joined_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.as_str().or_else(|| part.get("text").and_then(Value::as_str)))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn value_to_output(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    }
}

fn tool(
    id: ItemId,
    tool_type: &str,
    title: String,
    detail: String,
    raw: &Value,
    output: String,
    changes: Vec<FileChange>,
) -> ThreadItem {
    ThreadItem::Tool {
        id,
        tool_type: tool_type.to_string(),
        title,
        detail,
        status: text(raw, &["status"])
            .or_else(|| raw.get("details").and_then(|details| text(details, &["status"])))
            .map(|status| ToolStatus::parse(&status))
            .unwrap_or(ToolStatus::Unknown),
        output,
        changes,
    }
}

/// Convert a raw server item into its display form. Unknown item types and
/// items without an id yield `None`.
pub fn parse_thread_item(raw: &Value) -> Option<ThreadItem> {
    let id = ItemId::confirmed(text(raw, &["id"])?);
    let item = match item_type(raw)? {
        "userMessage" => {
            let content = raw.get("content").and_then(Value::as_array);
            let mut texts = Vec::new();
            let mut images = Vec::new();
            for part in content.into_iter().flatten() {
                match item_type(part) {
                    Some("image") => images.extend(text(part, &["url", "imageUrl", "image_url"])),
                    Some("localImage") => images.extend(text(part, &["path"])),
                    _ => texts.extend(part.get("text").and_then(Value::as_str).map(str::to_string)),
                }
            }
            let text = if texts.is_empty() {
                raw_text(raw, &["text"]).unwrap_or_default()
            } else {
                texts.join("\n")
            };
            ThreadItem::user_message(id, text, images)
        }
        "agentMessage" => ThreadItem::assistant_message(id, raw_text(raw, &["text"]).unwrap_or_default()),
        "reasoning" => ThreadItem::Reasoning {
            id,
            summary: joined_text(raw.get("summary")),
            content: joined_text(raw.get("content")),
        },
        "commandExecution" => {
            let command = match raw.get("command") {
                Some(Value::Array(argv)) => {
                    let argv: Vec<&str> = argv.iter().filter_map(Value::as_str).collect();
                    shell_words::join(argv)
                }
                Some(Value::String(command)) => command.clone(),
                _ => String::new(),
            };
            tool(
                id,
                "commandExecution",
                format!("Command: {command}"),
                text(raw, &["cwd"]).unwrap_or_default(),
                raw,
                raw_text(raw, &["aggregatedOutput", "aggregated_output", "output"]).unwrap_or_default(),
                Vec::new(),
            )
        }
        "fileChange" => {
            let changes: Vec<FileChange> = raw
                .get("changes")
                .and_then(Value::as_array)
                .map(|changes| {
                    changes
                        .iter()
                        .filter_map(|change| {
                            Some(FileChange {
                                path: text(change, &["path"])?,
                                kind: change
                                    .get("kind")
                                    .and_then(|kind| {
                                        kind.as_str()
                                            .or_else(|| kind.get("type").and_then(Value::as_str))
                                    })
                                    .unwrap_or("update")
                                    .to_string(),
                                diff: raw_text(change, &["diff"]),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            let paths: Vec<&str> = changes.iter().map(|change| change.path.as_str()).collect();
            let detail = paths.join(", ");
            tool(
                id,
                "fileChange",
                "File changes".to_string(),
                detail,
                raw,
                raw_text(raw, &["output"]).unwrap_or_default(),
                changes,
            )
        }
        "mcpToolCall" => {
            let server = text(raw, &["server"]).unwrap_or_default();
            let tool_name = text(raw, &["tool"]).unwrap_or_default();
            let output = raw
                .get("result")
                .map(value_to_output)
                .filter(|output| !output.is_empty())
                .or_else(|| raw.get("error").and_then(error_message))
                .unwrap_or_default();
            tool(
                id,
                "mcpToolCall",
                format!("Tool: {server} / {tool_name}"),
                raw.get("arguments").map(value_to_output).unwrap_or_default(),
                raw,
                output,
                Vec::new(),
            )
        }
        "webSearch" => tool(
            id,
            "webSearch",
            "Web search".to_string(),
            text(raw, &["query"]).unwrap_or_default(),
            raw,
            String::new(),
            Vec::new(),
        ),
        "imageView" => tool(
            id,
            "imageView",
            "Image view".to_string(),
            text(raw, &["path"]).unwrap_or_default(),
            raw,
            String::new(),
            Vec::new(),
        ),
        "collabAgentToolCall" | "collabToolCall" => {
            let details = raw.get("details").unwrap_or(raw);
            tool(
                id,
                "collabToolCall",
                format!("Collab: {}", text(details, &["tool"]).unwrap_or_else(|| "agent".to_string())),
                text(details, &["prompt"]).unwrap_or_default(),
                raw,
                String::new(),
                Vec::new(),
            )
        }
        "contextCompaction" => tool(
            id,
            "contextCompaction",
            "Context compaction".to_string(),
            String::new(),
            raw,
            String::new(),
            Vec::new(),
        ),
        "enteredReviewMode" => ThreadItem::Review {
            id,
            state: ReviewState::Started,
            text: raw_text(raw, &["review"]).unwrap_or_default(),
        },
        "exitedReviewMode" => ThreadItem::Review {
            id,
            state: ReviewState::Completed,
            text: raw_text(raw, &["review"]).unwrap_or_default(),
        },
        _ => return None,
    };
    Some(item)
}

/// Flatten the turns of a `thread/resume` result into items, in order.
pub fn items_from_turns(thread: &Value) -> Vec<ThreadItem> {
    let Some(turns) = thread.get("turns").and_then(Value::as_array) else {
        return Vec::new();
    };
    turns
        .iter()
        .filter_map(|turn| turn.get("items").and_then(Value::as_array))
        .flatten()
        .filter_map(parse_thread_item)
        .collect()
}

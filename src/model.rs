//! Domain data model: items, threads, plans and token usage

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::OnceLock;

/// Item identifier with an explicit provisional/confirmed tag.
///
/// Provisional ids are minted locally for optimistic user messages
/// (`<epoch-ms>-user`) and never collide with server-issued ids in practice;
/// the tag, not the string shape, is what reconciliation consults.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ItemId {
    value: String,
    provisional: bool,
}

fn legacy_provisional_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+-user$").ok()).as_ref()
}

impl ItemId {
    /// A server-issued id
    pub fn confirmed(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            provisional: false,
        }
    }

    /// Fresh optimistic id for a user message sent just now
    pub fn provisional_user() -> Self {
        Self::provisional_user_at(Utc::now())
    }

    pub fn provisional_user_at(at: DateTime<Utc>) -> Self {
        Self {
            value: format!("{}-user", at.timestamp_millis()),
            provisional: true,
        }
    }

    /// Interpret an id of unknown origin, e.g. one restored from a cache
    /// written before the tag existed.
    pub fn from_raw(value: impl Into<String>) -> Self {
        let value = value.into();
        let provisional = legacy_provisional_pattern().is_some_and(|pattern| pattern.is_match(&value));
        Self { value, provisional }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn is_provisional(&self) -> bool {
        self.provisional
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Tool call status, ordered from least to most specific
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolStatus {
    Unknown,
    Pending,
    InProgress,
    Completed,
    Failed,
    Declined,
}

impl ToolStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "pending" | "queued" => ToolStatus::Pending,
            "inprogress" | "running" | "started" => ToolStatus::InProgress,
            "completed" | "complete" | "success" | "succeeded" | "done" => ToolStatus::Completed,
            "failed" | "error" | "errored" => ToolStatus::Failed,
            "declined" | "rejected" | "denied" => ToolStatus::Declined,
            _ => ToolStatus::Unknown,
        }
    }

    /// Terminal statuses are equally specific; anything else ranks by order.
    pub fn specificity(self) -> u8 {
        match self {
            ToolStatus::Unknown => 0,
            ToolStatus::Pending => 1,
            ToolStatus::InProgress => 2,
            ToolStatus::Completed | ToolStatus::Failed | ToolStatus::Declined => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.specificity() == 3
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub path: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewState {
    Started,
    Completed,
}

/// One unit of conversation content
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ThreadItem {
    Message {
        id: ItemId,
        role: Role,
        text: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        images: Vec<String>,
    },
    Reasoning {
        id: ItemId,
        summary: String,
        content: String,
    },
    Tool {
        id: ItemId,
        tool_type: String,
        title: String,
        detail: String,
        status: ToolStatus,
        output: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        changes: Vec<FileChange>,
    },
    Review {
        id: ItemId,
        state: ReviewState,
        text: String,
    },
}

impl ThreadItem {
    pub fn user_message(id: ItemId, text: impl Into<String>, images: Vec<String>) -> Self {
        ThreadItem::Message {
            id,
            role: Role::User,
            text: text.into(),
            images,
        }
    }

    pub fn assistant_message(id: ItemId, text: impl Into<String>) -> Self {
        ThreadItem::Message {
            id,
            role: Role::Assistant,
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn id(&self) -> &ItemId {
        match self {
            ThreadItem::Message { id, .. }
            | ThreadItem::Reasoning { id, .. }
            | ThreadItem::Tool { id, .. }
            | ThreadItem::Review { id, .. } => id,
        }
    }

    /// Text of a user message, if this is one
    pub fn user_text(&self) -> Option<&str> {
        match self {
            ThreadItem::Message {
                role: Role::User,
                text,
                ..
            } => Some(text),
            _ => None,
        }
    }

    pub fn is_provisional_user(&self) -> bool {
        self.user_text().is_some() && self.id().is_provisional()
    }

    pub fn is_tool(&self) -> bool {
        matches!(self, ThreadItem::Tool { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
}

impl StepStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "completed" | "done" => StepStatus::Completed,
            "inprogress" | "active" | "running" => StepStatus::InProgress,
            _ => StepStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    pub step: String,
    pub status: StepStatus,
}

/// Token counts for one scope (whole thread or last turn)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBreakdown {
    pub total_tokens: i64,
    pub input_tokens: i64,
    pub cached_input_tokens: i64,
    pub output_tokens: i64,
    pub reasoning_output_tokens: i64,
}

impl TokenBreakdown {
    /// Read a usage object in either naming convention. Cache reads and cache
    /// creation both count as cached input.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let input_tokens = usage_number(map, &["inputTokens", "input_tokens"]);
        let output_tokens = usage_number(map, &["outputTokens", "output_tokens"]);
        let cached_input_tokens = match usage_field(map, &["cachedInputTokens", "cached_input_tokens"]) {
            Some(cached) => cached,
            None => {
                usage_number(map, &["cacheReadInputTokens", "cache_read_input_tokens"])
                    + usage_number(map, &["cacheCreationInputTokens", "cache_creation_input_tokens"])
            }
        };
        let reasoning_output_tokens =
            usage_number(map, &["reasoningOutputTokens", "reasoning_output_tokens"]);
        let total_tokens = usage_field(map, &["totalTokens", "total_tokens"])
            .unwrap_or(input_tokens + output_tokens + cached_input_tokens);
        Self {
            total_tokens,
            input_tokens,
            cached_input_tokens,
            output_tokens,
            reasoning_output_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub total: TokenBreakdown,
    pub last: TokenBreakdown,
    pub model_context_window: Option<i64>,
}

impl TokenUsage {
    /// Normalize a usage payload. Accepts the nested `{total, last}` shape or
    /// a flat counter object (which then fills both scopes).
    pub fn from_value(raw: &Value) -> Option<Self> {
        let map = raw.as_object()?;
        let nested_total = map
            .get("total")
            .or_else(|| map.get("totalTokenUsage"))
            .or_else(|| map.get("total_token_usage"))
            .and_then(Value::as_object);
        let (total, last) = match nested_total {
            Some(total) => {
                let total = TokenBreakdown::from_map(total);
                let last = map
                    .get("last")
                    .or_else(|| map.get("lastTokenUsage"))
                    .or_else(|| map.get("last_token_usage"))
                    .and_then(Value::as_object)
                    .map(TokenBreakdown::from_map)
                    .unwrap_or(total);
                (total, last)
            }
            None => {
                let flat = TokenBreakdown::from_map(map);
                (flat, flat)
            }
        };
        let model_context_window = usage_field(map, &["modelContextWindow", "model_context_window"])
            .or_else(|| {
                map.get("modelUsage")
                    .or_else(|| map.get("model_usage"))
                    .and_then(Value::as_object)
                    .and_then(|models| models.values().next())
                    .and_then(|model| model.get("contextWindow"))
                    .and_then(Value::as_i64)
            });
        Some(Self {
            total,
            last,
            model_context_window,
        })
    }
}

fn usage_field(map: &Map<String, Value>, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|key| {
        let value = map.get(*key)?;
        value
            .as_i64()
            .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
    })
}

fn usage_number(map: &Map<String, Value>, keys: &[&str]) -> i64 {
    usage_field(map, keys).unwrap_or(0)
}

/// One question of a user-input request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInputQuestion {
    pub id: String,
    pub header: String,
    pub question: String,
    pub options: Vec<UserInputOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInputOption {
    pub label: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Row of a `thread/list` page
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub id: String,
    pub name: Option<String>,
    pub preview: String,
    pub parent_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ThreadSummary {
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = value.get("id").and_then(Value::as_str)?.trim();
        if id.is_empty() {
            return None;
        }
        let text = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| value.get(*key).and_then(Value::as_str))
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(str::to_string)
        };
        Some(Self {
            id: id.to_string(),
            name: text(&["name", "title"]),
            preview: text(&["preview"]).unwrap_or_default(),
            parent_id: text(&["parentId", "parent_id", "parentThreadId"]),
            updated_at: ["updatedAt", "updated_at", "createdAt", "created_at"]
                .iter()
                .find_map(|key| value.get(*key).and_then(parse_timestamp)),
        })
    }
}

/// Timestamps arrive as epoch seconds, epoch milliseconds or RFC 3339.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(number) = value.as_i64() {
        // Anything past year ~2286 in seconds is really milliseconds.
        return if number > 9_999_999_999 {
            Utc.timestamp_millis_opt(number).single()
        } else {
            Utc.timestamp_opt(number, 0).single()
        };
    }
    value
        .as_str()
        .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// A conversation and its aggregate status
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub name: Option<String>,
    pub parent_id: Option<String>,
    /// Created locally and not yet confirmed by the server
    pub provisional: bool,
    pub items: Vec<ThreadItem>,
    pub is_processing: bool,
    pub is_reviewing: bool,
    pub has_unread: bool,
    pub active_turn_id: Option<String>,
    pub plan: Vec<PlanStep>,
    pub plan_explanation: Option<String>,
    pub diff: Option<String>,
    pub token_usage: Option<TokenUsage>,
    pub last_error: Option<String>,
}

impl Thread {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_provisional_ids_are_tagged() {
        let id = ItemId::provisional_user_at(Utc.timestamp_millis_opt(1_700_000_000_123).unwrap());
        assert_eq!(id.as_str(), "1700000000123-user");
        assert!(id.is_provisional());
        assert!(!ItemId::confirmed("1700000000123-user").is_provisional());
    }

    #[test]
    fn test_legacy_ids_are_recognized() {
        assert!(ItemId::from_raw("1712345678901-user").is_provisional());
        assert!(!ItemId::from_raw("item_abc").is_provisional());
        assert!(!ItemId::from_raw("12-user-x").is_provisional());
    }

    #[test]
    fn test_tool_status_specificity() {
        assert_eq!(ToolStatus::parse("in_progress"), ToolStatus::InProgress);
        assert_eq!(ToolStatus::parse("inProgress"), ToolStatus::InProgress);
        assert_eq!(ToolStatus::parse("success"), ToolStatus::Completed);
        assert!(ToolStatus::Completed.specificity() > ToolStatus::InProgress.specificity());
        assert_eq!(ToolStatus::parse("whatever"), ToolStatus::Unknown);
    }

    #[test]
    fn test_flat_usage_sums_cache_counts() {
        let usage = TokenUsage::from_value(&json!({
            "input_tokens": 100,
            "output_tokens": "20",
            "cache_read_input_tokens": 5,
            "cacheCreationInputTokens": 7,
            "modelUsage": {"some-model": {"contextWindow": 200000}}
        }))
        .unwrap();
        assert_eq!(usage.total.cached_input_tokens, 12);
        assert_eq!(usage.total.total_tokens, 132);
        assert_eq!(usage.last, usage.total);
        assert_eq!(usage.model_context_window, Some(200_000));
    }

    #[test]
    fn test_nested_usage_keeps_scopes_apart() {
        let usage = TokenUsage::from_value(&json!({
            "total": {"totalTokens": 900, "inputTokens": 800, "outputTokens": 100},
            "last": {"totalTokens": 90, "inputTokens": 80, "outputTokens": 10},
            "modelContextWindow": 128000
        }))
        .unwrap();
        assert_eq!(usage.total.total_tokens, 900);
        assert_eq!(usage.last.total_tokens, 90);
        assert_eq!(usage.model_context_window, Some(128_000));
        assert!(TokenUsage::from_value(&json!("nope")).is_none());
    }

    #[test]
    fn test_thread_summary_from_list_entry() {
        let summary = ThreadSummary::from_value(&json!({
            "id": "thr_1",
            "preview": "fix the build",
            "updatedAt": 1_700_000_000,
            "parentId": "thr_0"
        }))
        .unwrap();
        assert_eq!(summary.parent_id.as_deref(), Some("thr_0"));
        assert_eq!(summary.updated_at.unwrap().timestamp(), 1_700_000_000);
        assert!(ThreadSummary::from_value(&json!({"preview": "x"})).is_none());
    }

    #[test]
    fn test_timestamp_formats() {
        let ms = parse_timestamp(&json!(1_700_000_000_500_i64)).unwrap();
        assert_eq!(ms.timestamp_millis(), 1_700_000_000_500);
        let iso = parse_timestamp(&json!("2024-01-02T03:04:05Z")).unwrap();
        assert_eq!(iso.timestamp(), 1_704_164_645);
    }
}

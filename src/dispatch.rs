//! Command dispatch facade
//!
//! `AgentSession` is what a UI calls: typed operations that validate their
//! identifiers, apply optimistic local state, and compile into channel
//! requests. Every error comes back wrapped with workspace, thread and method.

use crate::approvals::{
    ApprovalArbiter, ApprovalDecision, ApprovalRequest, PendingUserInput, PermissionDenial, RuleStore,
};
use crate::channel::SessionChannel;
use crate::events::{items_from_turns, DomainEvent};
use crate::model::{Thread, ThreadItem, ThreadSummary};
use crate::protocol::{methods, notifications};
use crate::reconciler::{ThreadRow, ThreadStore};
use crate::{BridgeError, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One page of `thread/list`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPage {
    pub threads: Vec<ThreadSummary>,
    pub next_cursor: Option<String>,
}

/// Typed operations against one connected workspace
pub struct AgentSession {
    workspace_id: String,
    workspace_path: PathBuf,
    channel: Arc<SessionChannel>,
    store: Arc<RwLock<ThreadStore>>,
    arbiter: Arc<RwLock<ApprovalArbiter>>,
    rules: Arc<dyn RuleStore>,
}

impl AgentSession {
    pub fn new(
        workspace_id: &str,
        workspace_path: &Path,
        channel: Arc<SessionChannel>,
        store: Arc<RwLock<ThreadStore>>,
        arbiter: Arc<RwLock<ApprovalArbiter>>,
        rules: Arc<dyn RuleStore>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            workspace_path: workspace_path.to_path_buf(),
            channel,
            store,
            arbiter,
            rules,
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn channel(&self) -> &Arc<SessionChannel> {
        &self.channel
    }

    fn wrap(&self, method: &str, thread_id: Option<&str>, source: BridgeError) -> BridgeError {
        BridgeError::Dispatch {
            workspace_id: self.workspace_id.clone(),
            thread_id: thread_id.map(str::to_string),
            method: method.to_string(),
            source: Box::new(source),
        }
    }

    fn require(&self, method: &str, thread_id: Option<&str>, name: &str, value: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(self.wrap(
                method,
                thread_id,
                BridgeError::InvalidArgument(format!("{name} is required")),
            ));
        }
        Ok(())
    }

    async fn call(&self, method: &str, thread_id: Option<&str>, params: Value) -> Result<Value> {
        debug!("[{}] {} {:?}", self.workspace_id, method, thread_id);
        self.channel
            .send(method, params)
            .await
            .map_err(|e| self.wrap(method, thread_id, e))
    }

    /// Start a new thread. A provisional entry shows up in the store right
    /// away and is re-keyed once the server answers.
    pub async fn start_thread(&self) -> Result<String> {
        let provisional = self.store.write().await.create_provisional_thread();
        let params = json!({ "cwd": self.workspace_path.display().to_string() });
        let result = match self.call(methods::THREAD_START, None, params).await {
            Ok(result) => result,
            Err(e) => {
                self.store.write().await.remove_thread(&provisional);
                return Err(e);
            }
        };
        let Some(thread_id) = result
            .get("thread")
            .and_then(|thread| thread.get("id"))
            .or_else(|| result.get("threadId"))
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            self.store.write().await.remove_thread(&provisional);
            return Err(self.wrap(
                methods::THREAD_START,
                None,
                BridgeError::Malformed("thread/start result has no thread id".to_string()),
            ));
        };
        self.store.write().await.confirm_thread(&provisional, &thread_id);
        info!("[{}] started thread {}", self.workspace_id, thread_id);
        Ok(thread_id)
    }

    /// Load a thread's history and merge it into local state.
    pub async fn resume_thread(&self, thread_id: &str) -> Result<Vec<ThreadItem>> {
        self.require(methods::THREAD_RESUME, Some(thread_id), "thread id", thread_id)?;
        let result = self
            .call(methods::THREAD_RESUME, Some(thread_id), json!({ "threadId": thread_id }))
            .await?;
        let thread = result.get("thread").unwrap_or(&result);
        let remote = items_from_turns(thread);
        let mut store = self.store.write().await;
        store.set_items(thread_id, remote);
        if let Some(summary) = ThreadSummary::from_value(thread) {
            store.upsert_summaries(&[summary]);
        }
        Ok(store.thread_items(thread_id))
    }

    pub async fn list_threads(&self, cursor: Option<&str>, limit: Option<u32>) -> Result<ThreadPage> {
        let mut params = json!({});
        if let Some(cursor) = cursor.filter(|cursor| !cursor.trim().is_empty()) {
            params["cursor"] = json!(cursor);
        }
        if let Some(limit) = limit {
            params["limit"] = json!(limit);
        }
        let result = self.call(methods::THREAD_LIST, None, params).await?;
        let threads: Vec<ThreadSummary> = result
            .get("data")
            .or_else(|| result.get("threads"))
            .and_then(Value::as_array)
            .map(|rows| rows.iter().filter_map(ThreadSummary::from_value).collect())
            .unwrap_or_default();
        let next_cursor = ["nextCursor", "next_cursor"]
            .iter()
            .find_map(|key| result.get(*key).and_then(Value::as_str))
            .map(str::to_string);
        self.store.write().await.upsert_summaries(&threads);
        Ok(ThreadPage { threads, next_cursor })
    }

    pub async fn archive_thread(&self, thread_id: &str) -> Result<()> {
        self.require(methods::THREAD_ARCHIVE, Some(thread_id), "thread id", thread_id)?;
        self.call(methods::THREAD_ARCHIVE, Some(thread_id), json!({ "threadId": thread_id }))
            .await?;
        self.store.write().await.remove_thread(thread_id);
        Ok(())
    }

    /// Send a user message. It is shown immediately as a provisional item
    /// and withdrawn again if the request fails. Returns the turn id.
    pub async fn start_turn(&self, thread_id: &str, text: &str, images: Vec<String>) -> Result<Option<String>> {
        self.require(methods::TURN_START, Some(thread_id), "thread id", thread_id)?;
        if text.trim().is_empty() && images.is_empty() {
            return Err(self.wrap(
                methods::TURN_START,
                Some(thread_id),
                BridgeError::InvalidArgument("message text or an image is required".to_string()),
            ));
        }
        // Image-only turns echo back with empty text.
        let text = if text.trim().is_empty() { "" } else { text };
        let mut input = Vec::new();
        if !text.is_empty() {
            input.push(json!({ "type": "text", "text": text }));
        }
        for image in &images {
            input.push(image_input(image));
        }
        let optimistic_id = self
            .store
            .write()
            .await
            .insert_optimistic_user_message(thread_id, text, images);

        let params = json!({ "threadId": thread_id, "input": input });
        match self.call(methods::TURN_START, Some(thread_id), params).await {
            Ok(result) => Ok(result
                .get("turn")
                .and_then(|turn| turn.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)),
            Err(e) => {
                let mut store = self.store.write().await;
                store.remove_item(thread_id, &optimistic_id);
                store.mark_processing(thread_id, false);
                Err(e)
            }
        }
    }

    /// Ask the agent to stop the running turn without waiting for it to
    /// agree; the thread is shown idle right away.
    pub async fn interrupt_turn(&self, thread_id: &str, turn_id: &str) -> Result<()> {
        self.require(methods::TURN_INTERRUPT, Some(thread_id), "thread id", thread_id)?;
        self.require(methods::TURN_INTERRUPT, Some(thread_id), "turn id", turn_id)?;
        self.store.write().await.mark_processing(thread_id, false);

        let channel = self.channel.clone();
        let params = json!({ "threadId": thread_id, "turnId": turn_id });
        let label = format!("{}/{}", self.workspace_id, thread_id);
        tokio::spawn(async move {
            if let Err(e) = channel.send(methods::TURN_INTERRUPT, params).await {
                warn!("[{}] interrupt not acknowledged: {}", label, e);
            }
        });
        Ok(())
    }

    /// Start a review of `target` (e.g. `{"type": "uncommittedChanges"}`).
    pub async fn start_review(&self, thread_id: &str, target: Value) -> Result<Value> {
        self.require(methods::REVIEW_START, Some(thread_id), "thread id", thread_id)?;
        if !target.is_object() {
            return Err(self.wrap(
                methods::REVIEW_START,
                Some(thread_id),
                BridgeError::InvalidArgument("review target must be an object".to_string()),
            ));
        }
        let params = json!({ "threadId": thread_id, "target": target, "delivery": "inline" });
        self.call(methods::REVIEW_START, Some(thread_id), params).await
    }

    pub async fn compact_thread(&self, thread_id: &str) -> Result<()> {
        self.require(methods::THREAD_COMPACT, Some(thread_id), "thread id", thread_id)?;
        self.call(methods::THREAD_COMPACT, Some(thread_id), json!({ "threadId": thread_id }))
            .await?;
        Ok(())
    }

    pub async fn set_thread_name(&self, thread_id: &str, name: &str) -> Result<()> {
        self.require(methods::THREAD_SET_NAME, Some(thread_id), "thread id", thread_id)?;
        self.require(methods::THREAD_SET_NAME, Some(thread_id), "name", name)?;
        self.call(
            methods::THREAD_SET_NAME,
            Some(thread_id),
            json!({ "threadId": thread_id, "name": name.trim() }),
        )
        .await?;
        self.store
            .write()
            .await
            .apply(&DomainEvent::ThreadNameUpdated {
                thread_id: thread_id.to_string(),
                name: Some(name.trim().to_string()),
            });
        Ok(())
    }

    pub async fn model_list(&self) -> Result<Value> {
        self.call(methods::MODEL_LIST, None, json!({})).await
    }

    /// Answer an approval request. The request disappears from the pending
    /// list even if the answer cannot be delivered.
    pub async fn respond_approval(&self, request_id: u64, decision: ApprovalDecision) -> Result<()> {
        let mut arbiter = self.arbiter.write().await;
        let thread_id = arbiter
            .approval(request_id)
            .and_then(|request| request.thread_id.clone());
        let method = arbiter
            .approval(request_id)
            .map(|request| request.method.clone())
            .unwrap_or_else(|| "approval".to_string());
        arbiter
            .decide(self.channel.as_ref(), request_id, &decision)
            .map_err(|e| self.wrap(&method, thread_id.as_deref(), e))
    }

    /// Answer the questions a tool call asked, keyed by question id.
    pub async fn respond_user_input(
        &self,
        thread_id: &str,
        tool_use_id: &str,
        answers: HashMap<String, Vec<String>>,
    ) -> Result<()> {
        let method = notifications::REQUEST_USER_INPUT;
        self.require(method, Some(thread_id), "thread id", thread_id)?;
        self.require(method, Some(thread_id), "tool use id", tool_use_id)?;
        self.arbiter
            .write()
            .await
            .answer_user_input(self.channel.as_ref(), thread_id, tool_use_id, &answers)
            .map_err(|e| self.wrap(method, Some(thread_id), e))
    }

    /// Persist an "always allow" rule. Resolves to `false` if it was known.
    pub async fn remember_rule(&self, rule: &str) -> Result<bool> {
        self.rules
            .remember(rule)
            .await
            .map_err(|e| self.wrap("rules/remember", None, e))
    }

    pub async fn dismiss_denial(&self, denial_id: &str) -> Result<()> {
        self.arbiter
            .write()
            .await
            .dismiss_denial(denial_id)
            .map(|_| ())
            .ok_or_else(|| {
                self.wrap(
                    "denial/dismiss",
                    None,
                    BridgeError::InvalidArgument(format!("no denial {denial_id}")),
                )
            })
    }

    /// Turn a denial into a persistent rule and drop it. With `retry`, the
    /// agent is asked to run the call again in the same thread.
    pub async fn allow_denied_call(&self, denial_id: &str, retry: bool) -> Result<()> {
        let denial = self.arbiter.read().await.denial(denial_id).cloned();
        let Some(denial) = denial else {
            return Err(self.wrap(
                "denial/allow",
                None,
                BridgeError::InvalidArgument(format!("no denial {denial_id}")),
            ));
        };
        let Some(rule) = denial.rule.clone() else {
            return Err(self.wrap(
                "denial/allow",
                Some(&denial.thread_id),
                BridgeError::InvalidArgument(format!("no rule can be derived for {}", denial.tool_name)),
            ));
        };
        self.remember_rule(&rule.rule).await?;
        self.arbiter.write().await.dismiss_denial(denial_id);
        if retry {
            let prompt = format!(
                "Permission granted for {}. Please retry the {} call that was denied.",
                rule.label, denial.tool_name
            );
            self.start_turn(&denial.thread_id, &prompt, Vec::new()).await?;
        }
        Ok(())
    }

    pub async fn set_active_thread(&self, thread_id: Option<&str>) {
        self.store.write().await.set_active_thread(thread_id);
    }

    pub async fn toggle_collapsed(&self, thread_id: &str) -> bool {
        self.store.write().await.toggle_collapsed(thread_id)
    }

    pub async fn threads(&self) -> Vec<Thread> {
        self.store.read().await.threads().cloned().collect()
    }

    pub async fn thread_items(&self, thread_id: &str) -> Vec<ThreadItem> {
        self.store.read().await.thread_items(thread_id)
    }

    pub async fn thread_rows(&self) -> Vec<ThreadRow> {
        self.store.read().await.thread_rows()
    }

    pub async fn approvals(&self) -> Vec<ApprovalRequest> {
        self.arbiter.read().await.approvals().to_vec()
    }

    pub async fn user_inputs(&self) -> Vec<PendingUserInput> {
        self.arbiter.read().await.user_inputs().to_vec()
    }

    pub async fn denials(&self) -> Vec<PermissionDenial> {
        self.arbiter.read().await.denials().to_vec()
    }
}

fn image_input(image: &str) -> Value {
    let remote = ["http://", "https://", "data:"]
        .iter()
        .any(|prefix| image.starts_with(prefix));
    if remote {
        json!({ "type": "image", "url": image })
    } else {
        json!({ "type": "localImage", "path": image })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_input_kinds() {
        assert_eq!(image_input("https://x/y.png")["type"], "image");
        assert_eq!(image_input("data:image/png;base64,AAA")["type"], "image");
        assert_eq!(image_input("/tmp/shot.png")["type"], "localImage");
    }
}

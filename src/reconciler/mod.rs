//! Thread/turn state reconciler
//!
//! `ThreadStore` owns one workspace's threads and their items. It changes
//! only through [`ThreadStore::apply`] (classified server events) and the
//! optimistic operations the dispatch layer calls before a request is
//! answered; both paths go through the same merge rules.

mod merge;
mod normalize;
mod tree;

pub use merge::merge_items;
pub use normalize::{prepare_thread_items, truncate_text};
pub use tree::{thread_rows, ThreadRow};

use crate::config::BridgeConfig;
use crate::events::DomainEvent;
use crate::model::{ItemId, ReviewState, Thread, ThreadItem, ThreadSummary, ToolStatus};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Per-workspace thread state
#[derive(Debug)]
pub struct ThreadStore {
    threads: HashMap<String, Thread>,
    /// Display order, oldest first
    order: Vec<String>,
    active_thread: Option<String>,
    collapsed: HashSet<String>,
    provisional_counter: u64,
    max_item_text: usize,
    tool_output_window: usize,
}

impl Default for ThreadStore {
    fn default() -> Self {
        Self::new(&BridgeConfig::default())
    }
}

impl ThreadStore {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            threads: HashMap::new(),
            order: Vec::new(),
            active_thread: None,
            collapsed: HashSet::new(),
            provisional_counter: 0,
            max_item_text: config.max_item_text,
            tool_output_window: config.tool_output_window,
        }
    }

    pub fn thread(&self, thread_id: &str) -> Option<&Thread> {
        self.threads.get(thread_id)
    }

    /// Threads in display order
    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.order.iter().filter_map(|id| self.threads.get(id))
    }

    /// Items of a thread, normalized for display
    pub fn thread_items(&self, thread_id: &str) -> Vec<ThreadItem> {
        self.threads
            .get(thread_id)
            .map(|thread| {
                prepare_thread_items(thread.items.clone(), self.max_item_text, self.tool_output_window)
            })
            .unwrap_or_default()
    }

    pub fn active_thread(&self) -> Option<&str> {
        self.active_thread.as_deref()
    }

    /// Make `thread_id` the one the user is looking at; clears its unread flag.
    pub fn set_active_thread(&mut self, thread_id: Option<&str>) {
        self.active_thread = thread_id.map(str::to_string);
        if let Some(thread) = thread_id.and_then(|id| self.threads.get_mut(id)) {
            thread.has_unread = false;
        }
    }

    pub fn toggle_collapsed(&mut self, thread_id: &str) -> bool {
        if self.collapsed.remove(thread_id) {
            false
        } else {
            self.collapsed.insert(thread_id.to_string());
            true
        }
    }

    /// Visible rows of the thread tree
    pub fn thread_rows(&self) -> Vec<ThreadRow> {
        let entries: Vec<(String, Option<String>)> = self
            .threads()
            .map(|thread| (thread.id.clone(), thread.parent_id.clone()))
            .collect();
        thread_rows(&entries, &self.collapsed)
    }

    fn ensure_thread(&mut self, thread_id: &str) -> &mut Thread {
        if !self.threads.contains_key(thread_id) {
            self.order.push(thread_id.to_string());
        }
        self.threads
            .entry(thread_id.to_string())
            .or_insert_with(|| Thread::new(thread_id))
    }

    /// Record threads from a `thread/list` page without touching their items.
    pub fn upsert_summaries(&mut self, summaries: &[ThreadSummary]) {
        for summary in summaries {
            let thread = self.ensure_thread(&summary.id);
            if summary.name.is_some() {
                thread.name = summary.name.clone();
            }
            if summary.parent_id.is_some() && summary.parent_id.as_deref() != Some(summary.id.as_str()) {
                thread.parent_id = summary.parent_id.clone();
            }
        }
    }

    pub fn remove_thread(&mut self, thread_id: &str) -> Option<Thread> {
        self.order.retain(|id| id != thread_id);
        if self.active_thread.as_deref() == Some(thread_id) {
            self.active_thread = None;
        }
        self.collapsed.remove(thread_id);
        self.threads.remove(thread_id)
    }

    /// Placeholder for a thread the server has not confirmed yet.
    pub fn create_provisional_thread(&mut self) -> String {
        self.provisional_counter += 1;
        let id = format!(
            "pending-{}-{}",
            Utc::now().timestamp_millis(),
            self.provisional_counter
        );
        self.ensure_thread(&id).provisional = true;
        id
    }

    /// Re-key a provisional thread under its server id. If the server thread
    /// is already known (its creation event won the race), the two are merged
    /// into one.
    pub fn confirm_thread(&mut self, provisional_id: &str, server_id: &str) -> bool {
        if provisional_id == server_id {
            if let Some(thread) = self.threads.get_mut(server_id) {
                thread.provisional = false;
            }
            return true;
        }
        let Some(mut placeholder) = self.threads.remove(provisional_id) else {
            return false;
        };
        let position = self.order.iter().position(|id| id == provisional_id);
        self.order.retain(|id| id != provisional_id);

        match self.threads.get_mut(server_id) {
            Some(existing) => {
                existing.items = merge_items(&existing.items, &placeholder.items);
                existing.is_processing |= placeholder.is_processing;
                if existing.name.is_none() {
                    existing.name = placeholder.name.take();
                }
            }
            None => {
                placeholder.id = server_id.to_string();
                placeholder.provisional = false;
                self.threads.insert(server_id.to_string(), placeholder);
                match position {
                    Some(idx) => self.order.insert(idx.min(self.order.len()), server_id.to_string()),
                    None => self.order.push(server_id.to_string()),
                }
            }
        }

        for thread in self.threads.values_mut() {
            if thread.parent_id.as_deref() == Some(provisional_id) {
                thread.parent_id = Some(server_id.to_string());
            }
        }
        if self.active_thread.as_deref() == Some(provisional_id) {
            self.active_thread = Some(server_id.to_string());
        }
        if self.collapsed.remove(provisional_id) {
            self.collapsed.insert(server_id.to_string());
        }
        debug!("Confirmed thread {} as {}", provisional_id, server_id);
        true
    }

    /// Show a just-sent user message before the server echoes it.
    pub fn insert_optimistic_user_message(&mut self, thread_id: &str, text: &str, images: Vec<String>) -> ItemId {
        let id = ItemId::provisional_user();
        let thread = self.ensure_thread(thread_id);
        thread
            .items
            .push(ThreadItem::user_message(id.clone(), text, images));
        thread.is_processing = true;
        thread.last_error = None;
        id
    }

    /// Drop one item, e.g. an optimistic message whose send failed.
    pub fn remove_item(&mut self, thread_id: &str, item_id: &ItemId) -> bool {
        let Some(thread) = self.threads.get_mut(thread_id) else {
            return false;
        };
        let before = thread.items.len();
        thread.items.retain(|item| item.id() != item_id);
        thread.items.len() != before
    }

    /// Replace a thread's items with the server's list, keeping optimistic
    /// entries the server has not caught up with.
    /// Stored items stay untruncated so optimistic text can still be matched;
    /// display bounds apply in [`ThreadStore::thread_items`].
    pub fn set_items(&mut self, thread_id: &str, remote: Vec<ThreadItem>) {
        let thread = self.ensure_thread(thread_id);
        thread.items = merge_items(&remote, &thread.items);
        thread.provisional = false;
    }

    /// Optimistically mark a thread idle, e.g. after a fire-and-forget interrupt.
    pub fn mark_processing(&mut self, thread_id: &str, processing: bool) {
        if let Some(thread) = self.threads.get_mut(thread_id) {
            thread.is_processing = processing;
            if !processing {
                thread.active_turn_id = None;
            }
        }
    }

    /// Nothing can still be running once the agent is gone.
    pub fn clear_processing(&mut self) {
        for thread in self.threads.values_mut() {
            thread.is_processing = false;
            thread.is_reviewing = false;
            thread.active_turn_id = None;
        }
    }

    /// Apply a classified event. Returns whether any state changed.
    pub fn apply(&mut self, event: &DomainEvent) -> bool {
        match event {
            DomainEvent::ThreadCreated {
                thread_id,
                parent_id,
                name,
            } => {
                let thread = self.ensure_thread(thread_id);
                thread.provisional = false;
                if let Some(parent) = parent_id.as_deref().filter(|parent| *parent != thread_id.as_str()) {
                    thread.parent_id = Some(parent.to_string());
                }
                if name.is_some() {
                    thread.name = name.clone();
                }
            }
            DomainEvent::ThreadNameUpdated { thread_id, name } => {
                self.ensure_thread(thread_id).name = name.clone();
            }
            DomainEvent::TurnStarted { thread_id, turn_id } => {
                let thread = self.ensure_thread(thread_id);
                thread.is_processing = true;
                thread.active_turn_id = turn_id.clone();
                thread.last_error = None;
            }
            DomainEvent::TurnCompleted {
                thread_id, error, ..
            } => {
                let is_active = self.active_thread.as_deref() == Some(thread_id.as_str());
                let thread = self.ensure_thread(thread_id);
                thread.is_processing = false;
                thread.is_reviewing = false;
                thread.active_turn_id = None;
                if error.is_some() {
                    thread.last_error = error.clone();
                }
                if !is_active {
                    thread.has_unread = true;
                }
            }
            DomainEvent::TurnPlanUpdated {
                thread_id,
                explanation,
                plan,
                ..
            } => {
                let thread = self.ensure_thread(thread_id);
                thread.plan = plan.clone();
                thread.plan_explanation = explanation.clone();
            }
            DomainEvent::TurnDiffUpdated { thread_id, diff } => {
                self.ensure_thread(thread_id).diff = Some(diff.clone());
            }
            DomainEvent::TurnError {
                thread_id,
                message,
                will_retry,
                ..
            } => {
                let thread = self.ensure_thread(thread_id);
                thread.last_error = Some(message.clone());
                if !will_retry {
                    thread.is_processing = false;
                    thread.active_turn_id = None;
                }
            }
            DomainEvent::TokenUsageUpdated { thread_id, usage } => {
                self.ensure_thread(thread_id).token_usage = Some(*usage);
            }
            DomainEvent::ThreadCompacted { thread_id, .. } => {
                self.ensure_thread(thread_id);
            }
            DomainEvent::AgentMessageStarted { thread_id, item_id } => {
                let thread = self.ensure_thread(thread_id);
                if find_item(&mut thread.items, item_id).is_none() {
                    thread
                        .items
                        .push(ThreadItem::assistant_message(ItemId::confirmed(item_id.as_str()), ""));
                }
            }
            DomainEvent::AgentMessageDelta {
                thread_id,
                item_id,
                delta,
            } => {
                let thread = self.ensure_thread(thread_id);
                thread.is_processing = true;
                match find_item(&mut thread.items, item_id) {
                    Some(ThreadItem::Message { text, .. }) => text.push_str(delta),
                    Some(_) => return false,
                    None => thread.items.push(ThreadItem::assistant_message(
                        ItemId::confirmed(item_id.as_str()),
                        delta.as_str(),
                    )),
                }
            }
            DomainEvent::AgentMessageCompleted {
                thread_id,
                item_id,
                text,
            } => {
                let thread = self.ensure_thread(thread_id);
                let completed = ThreadItem::assistant_message(ItemId::confirmed(item_id.as_str()), text.as_str());
                upsert_item(&mut thread.items, completed);
            }
            DomainEvent::ItemStarted {
                thread_id,
                item,
                spawned_threads,
            } => {
                self.adopt_children(thread_id, spawned_threads);
                let thread = self.ensure_thread(thread_id);
                let mut item = item.clone();
                if let ThreadItem::Tool { status, .. } = &mut item {
                    if *status == ToolStatus::Unknown {
                        *status = ToolStatus::InProgress;
                    }
                }
                if let ThreadItem::Review {
                    state: ReviewState::Started,
                    ..
                } = item
                {
                    thread.is_reviewing = true;
                }
                upsert_item(&mut thread.items, item);
            }
            DomainEvent::ItemCompleted {
                thread_id,
                item,
                spawned_threads,
            } => {
                self.adopt_children(thread_id, spawned_threads);
                let thread = self.ensure_thread(thread_id);
                let mut item = item.clone();
                if let ThreadItem::Tool { status, .. } = &mut item {
                    if !status.is_terminal() {
                        *status = ToolStatus::Completed;
                    }
                }
                if let ThreadItem::Review {
                    state: ReviewState::Completed,
                    ..
                } = item
                {
                    thread.is_reviewing = false;
                }
                upsert_item(&mut thread.items, item);
            }
            DomainEvent::ReasoningSummaryDelta {
                thread_id,
                item_id,
                delta,
            } => {
                let thread = self.ensure_thread(thread_id);
                if let Some((summary, _)) = reasoning_mut(&mut thread.items, item_id) {
                    summary.push_str(delta);
                }
            }
            DomainEvent::ReasoningSummaryBoundary { thread_id, item_id } => {
                let thread = self.ensure_thread(thread_id);
                if let Some((summary, _)) = reasoning_mut(&mut thread.items, item_id) {
                    if !summary.is_empty() {
                        summary.push_str("\n\n");
                    }
                }
            }
            DomainEvent::ReasoningTextDelta {
                thread_id,
                item_id,
                delta,
            } => {
                let thread = self.ensure_thread(thread_id);
                if let Some((_, content)) = reasoning_mut(&mut thread.items, item_id) {
                    content.push_str(delta);
                }
            }
            DomainEvent::CommandOutputDelta {
                thread_id,
                item_id,
                delta,
            } => {
                let thread = self.ensure_thread(thread_id);
                if let Some(output) = tool_output_mut(&mut thread.items, item_id, "commandExecution") {
                    output.push_str(delta);
                }
            }
            DomainEvent::FileChangeOutputDelta {
                thread_id,
                item_id,
                delta,
            } => {
                let thread = self.ensure_thread(thread_id);
                if let Some(output) = tool_output_mut(&mut thread.items, item_id, "fileChange") {
                    output.push_str(delta);
                }
            }
            DomainEvent::TerminalInteraction {
                thread_id,
                item_id,
                stdin,
            } => {
                if stdin.is_empty() {
                    return false;
                }
                let thread = self.ensure_thread(thread_id);
                if let Some(output) = tool_output_mut(&mut thread.items, item_id, "commandExecution") {
                    if !output.is_empty() && !output.ends_with('\n') {
                        output.push('\n');
                    }
                    output.push_str("> ");
                    output.push_str(stdin);
                }
            }
            DomainEvent::ChannelClosed { .. } => self.clear_processing(),
            DomainEvent::ConnectionEstablished
            | DomainEvent::ApprovalRequested { .. }
            | DomainEvent::UserInputRequested { .. }
            | DomainEvent::PermissionDenied { .. }
            | DomainEvent::Passthrough { .. } => return false,
        }
        true
    }

    fn adopt_children(&mut self, parent_id: &str, children: &[String]) {
        for child in children.iter().filter(|child| child.as_str() != parent_id) {
            self.ensure_thread(child).parent_id = Some(parent_id.to_string());
        }
    }
}

fn find_item<'a>(items: &'a mut [ThreadItem], item_id: &str) -> Option<&'a mut ThreadItem> {
    items.iter_mut().find(|item| item.id().as_str() == item_id)
}

/// Insert or refresh an item. A server user message takes over the slot of
/// the optimistic copy it confirms, so the list does not jump.
fn upsert_item(items: &mut Vec<ThreadItem>, incoming: ThreadItem) {
    if let Some(existing) = items.iter_mut().find(|item| item.id() == incoming.id()) {
        let merged = merge::prefer(&incoming, existing);
        *existing = merged;
        return;
    }
    if let Some(text) = incoming.user_text() {
        if !incoming.id().is_provisional() {
            if let Some(slot) = items
                .iter_mut()
                .find(|item| item.is_provisional_user() && item.user_text() == Some(text))
            {
                *slot = incoming;
                return;
            }
        }
    }
    items.push(incoming);
}

fn reasoning_mut<'a>(items: &'a mut Vec<ThreadItem>, item_id: &str) -> Option<(&'a mut String, &'a mut String)> {
    if find_item(items, item_id).is_none() {
        items.push(ThreadItem::Reasoning {
            id: ItemId::confirmed(item_id),
            summary: String::new(),
            content: String::new(),
        });
    }
    match find_item(items, item_id) {
        Some(ThreadItem::Reasoning { summary, content, .. }) => Some((summary, content)),
        _ => None,
    }
}

fn tool_output_mut<'a>(items: &'a mut Vec<ThreadItem>, item_id: &str, tool_type: &str) -> Option<&'a mut String> {
    if find_item(items, item_id).is_none() {
        items.push(ThreadItem::Tool {
            id: ItemId::confirmed(item_id),
            tool_type: tool_type.to_string(),
            title: String::new(),
            detail: String::new(),
            status: ToolStatus::InProgress,
            output: String::new(),
            changes: Vec::new(),
        });
    }
    match find_item(items, item_id) {
        Some(ThreadItem::Tool { output, .. }) => Some(output),
        _ => None,
    }
}

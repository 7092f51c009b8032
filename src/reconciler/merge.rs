//! Merging authoritative item lists with local state
//!
//! The server's list decides order and content. Local items survive only
//! when the server has no copy of them yet: a provisional user message is
//! dropped once it can claim an unmatched server message with the same text,
//! and anything else local-only stays where it was relative to the items
//! both sides share.

use crate::model::{ItemId, ThreadItem};
use std::collections::{HashMap, HashSet};

/// Merge `remote` (authoritative) with `local` (possibly optimistic).
pub fn merge_items(remote: &[ThreadItem], local: &[ThreadItem]) -> Vec<ThreadItem> {
    let local_by_id: HashMap<&ItemId, &ThreadItem> = local
        .iter()
        .filter(|item| !item.id().is_provisional())
        .map(|item| (item.id(), item))
        .collect();

    // Server user messages that no confirmed local item accounts for yet,
    // counted by text so repeated identical sends stay distinct.
    let mut unclaimed: HashMap<&str, usize> = HashMap::new();
    for item in remote {
        if let Some(text) = item.user_text() {
            if !local_by_id.contains_key(item.id()) {
                *unclaimed.entry(text).or_insert(0) += 1;
            }
        }
    }

    let remote_ids: HashSet<&ItemId> = remote.iter().map(ThreadItem::id).collect();

    // Local-only survivors, keyed by the shared item they followed.
    let mut anchored: HashMap<&ItemId, Vec<ThreadItem>> = HashMap::new();
    let mut unanchored: Vec<ThreadItem> = Vec::new();
    let mut anchor: Option<&ItemId> = None;
    for item in local {
        if remote_ids.contains(item.id()) && !item.id().is_provisional() {
            anchor = Some(item.id());
            continue;
        }
        if item.is_provisional_user() {
            let claimed = item
                .user_text()
                .and_then(|text| unclaimed.get_mut(text))
                .filter(|count| **count > 0)
                .map(|count| *count -= 1)
                .is_some();
            if claimed {
                continue;
            }
        }
        match anchor {
            Some(id) => anchored.entry(id).or_default().push(item.clone()),
            None => unanchored.push(item.clone()),
        }
    }

    let mut merged = Vec::with_capacity(remote.len() + unanchored.len());
    let mut emitted: HashSet<&ItemId> = HashSet::new();
    for item in remote {
        if !emitted.insert(item.id()) {
            continue;
        }
        let merged_item = match local_by_id.get(item.id()) {
            Some(local_item) => prefer(item, local_item),
            None => item.clone(),
        };
        merged.push(merged_item);
        if let Some(followers) = anchored.remove(item.id()) {
            merged.extend(followers);
        }
    }
    merged.extend(unanchored);
    merged
}

/// Pick the better of two copies of the same item. The server copy wins,
/// except that truncation or a lagging snapshot may have left it with less
/// tool output, a vaguer status, or empty text.
pub(crate) fn prefer(remote: &ThreadItem, local: &ThreadItem) -> ThreadItem {
    match (remote, local) {
        (
            ThreadItem::Tool {
                id,
                tool_type,
                title,
                detail,
                status,
                output,
                changes,
            },
            ThreadItem::Tool {
                status: local_status,
                output: local_output,
                changes: local_changes,
                ..
            },
        ) => ThreadItem::Tool {
            id: id.clone(),
            tool_type: tool_type.clone(),
            title: title.clone(),
            detail: detail.clone(),
            status: if local_status.specificity() > status.specificity() {
                *local_status
            } else {
                *status
            },
            output: if local_output.chars().count() > output.chars().count() {
                local_output.clone()
            } else {
                output.clone()
            },
            changes: if changes.is_empty() {
                local_changes.clone()
            } else {
                changes.clone()
            },
        },
        (
            ThreadItem::Message { text, .. },
            ThreadItem::Message {
                text: local_text, ..
            },
        ) if text.is_empty() && !local_text.is_empty() => local.clone(),
        _ => remote.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolStatus;
    use pretty_assertions::assert_eq;

    fn user(id: &str, text: &str) -> ThreadItem {
        ThreadItem::user_message(ItemId::confirmed(id), text, Vec::new())
    }

    fn pending(ms: &str, text: &str) -> ThreadItem {
        ThreadItem::user_message(ItemId::from_raw(format!("{ms}-user")), text, Vec::new())
    }

    fn reply(id: &str, text: &str) -> ThreadItem {
        ThreadItem::assistant_message(ItemId::confirmed(id), text)
    }

    fn tool(id: &str, status: ToolStatus, output: &str) -> ThreadItem {
        ThreadItem::Tool {
            id: ItemId::confirmed(id),
            tool_type: "commandExecution".to_string(),
            title: "Command: ls".to_string(),
            detail: String::new(),
            status,
            output: output.to_string(),
            changes: Vec::new(),
        }
    }

    #[test]
    fn test_empty_local_yields_remote() {
        let remote = vec![user("u1", "hi"), reply("a1", "hello")];
        assert_eq!(merge_items(&remote, &[]), remote);
    }

    #[test]
    fn test_local_subset_yields_remote() {
        let remote = vec![user("u1", "hi"), reply("a1", "hello"), user("u2", "again")];
        let local = vec![user("u1", "hi"), reply("a1", "hello")];
        assert_eq!(merge_items(&remote, &local), remote);
    }

    #[test]
    fn test_optimistic_message_is_replaced() {
        let local = vec![pending("1700000000000", "hi")];
        let remote = vec![user("srv-1", "hi"), reply("a1", "hello")];
        let merged = merge_items(&remote, &local);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id(), &ItemId::confirmed("srv-1"));
        assert!(!merged.iter().any(ThreadItem::is_provisional_user));
    }

    #[test]
    fn test_identical_sends_are_matched_by_count() {
        let local = vec![
            pending("1700000000000", "ok"),
            reply("a1", "sure"),
            pending("1700000000500", "ok"),
        ];
        let remote = vec![user("srv-1", "ok"), reply("a1", "sure")];
        let merged = merge_items(&remote, &local);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].id(), &ItemId::confirmed("srv-1"));
        assert_eq!(merged[1].id(), &ItemId::confirmed("a1"));
        assert!(merged[2].is_provisional_user());
        assert_eq!(merged[2].user_text(), Some("ok"));
    }

    #[test]
    fn test_known_server_message_is_not_claimed_twice() {
        // u1 is already confirmed locally, so the pending "hi" has nothing to claim.
        let local = vec![user("u1", "hi"), pending("1700000000000", "hi")];
        let remote = vec![user("u1", "hi")];
        let merged = merge_items(&remote, &local);
        assert_eq!(merged.len(), 2);
        assert!(merged[1].is_provisional_user());
    }

    #[test]
    fn test_text_must_match_exactly() {
        let local = vec![pending("1700000000000", "hi ")];
        let remote = vec![user("srv-1", "hi")];
        assert_eq!(merge_items(&remote, &local).len(), 2);
    }

    #[test]
    fn test_local_only_items_keep_relative_position() {
        let local = vec![
            user("u1", "build it"),
            tool("t-live", ToolStatus::InProgress, "compiling"),
            reply("a1", "working"),
        ];
        let remote = vec![user("u1", "build it"), reply("a1", "working"), reply("a2", "done")];
        let merged = merge_items(&remote, &local);
        let ids: Vec<&str> = merged.iter().map(|item| item.id().as_str()).collect();
        assert_eq!(ids, vec!["u1", "t-live", "a1", "a2"]);
    }

    #[test]
    fn test_tool_prefers_richer_copy() {
        let remote = vec![tool("t1", ToolStatus::InProgress, "abc")];
        let local = vec![tool("t1", ToolStatus::Completed, "abcdef")];
        let merged = merge_items(&remote, &local);
        let ThreadItem::Tool { status, output, .. } = &merged[0] else {
            panic!("expected tool");
        };
        assert_eq!(*status, ToolStatus::Completed);
        assert_eq!(output, "abcdef");

        let remote = vec![tool("t1", ToolStatus::Failed, "full output")];
        let local = vec![tool("t1", ToolStatus::InProgress, "full")];
        assert_eq!(merge_items(&remote, &local), remote);
    }

    #[test]
    fn test_duplicate_remote_ids_collapse() {
        let remote = vec![reply("a1", "x"), reply("a1", "x")];
        assert_eq!(merge_items(&remote, &[]).len(), 1);
    }
}

//! Display normalization for item lists

use crate::model::{ReviewState, Role, ThreadItem};
use std::borrow::Cow;

const ELLIPSIS: char = '…';

/// Cut `text` to at most `max` characters, the last being an ellipsis.
/// Text within the limit comes back untouched.
pub fn truncate_text(text: &str, max: usize) -> Cow<'_, str> {
    if max == 0 {
        return Cow::Borrowed("");
    }
    match text.char_indices().nth(max) {
        None => Cow::Borrowed(text),
        Some(_) => {
            let keep = text
                .char_indices()
                .nth(max - 1)
                .map(|(idx, _)| idx)
                .unwrap_or(text.len());
            let mut cut = String::with_capacity(keep + ELLIPSIS.len_utf8());
            cut.push_str(&text[..keep]);
            cut.push(ELLIPSIS);
            Cow::Owned(cut)
        }
    }
}

fn truncate_in_place(text: &mut String, max: usize) {
    if let Cow::Owned(cut) = truncate_text(text, max) {
        *text = cut;
    }
}

/// Prepare an item list for display: drop the one assistant message repeating
/// a completed review right before it, bound message text, and bound tool
/// output for all but the `tool_window` most recent tool items.
pub fn prepare_thread_items(items: Vec<ThreadItem>, max_text: usize, tool_window: usize) -> Vec<ThreadItem> {
    let mut prepared: Vec<ThreadItem> = Vec::with_capacity(items.len());
    // Text of a completed review whose echo has not been seen yet
    let mut open_review: Option<String> = None;
    for item in items {
        if let Some(review) = open_review.take() {
            if is_review_echo(&review, &item) {
                continue;
            }
        }
        open_review = completed_review_text(&item);
        prepared.push(item);
    }

    let tool_count = prepared.iter().filter(|item| item.is_tool()).count();
    let older_tools = tool_count.saturating_sub(tool_window);
    let mut seen_tools = 0;
    for item in &mut prepared {
        match item {
            ThreadItem::Message { text, .. } => truncate_in_place(text, max_text),
            ThreadItem::Reasoning { summary, content, .. } => {
                truncate_in_place(summary, max_text);
                truncate_in_place(content, max_text);
            }
            ThreadItem::Review { text, .. } => truncate_in_place(text, max_text),
            ThreadItem::Tool { output, .. } => {
                if seen_tools < older_tools {
                    truncate_in_place(output, max_text);
                }
                seen_tools += 1;
            }
        }
    }
    prepared
}

fn completed_review_text(item: &ThreadItem) -> Option<String> {
    match item {
        ThreadItem::Review {
            state: ReviewState::Completed,
            text,
            ..
        } if !text.trim().is_empty() => Some(text.trim().to_string()),
        _ => None,
    }
}

fn is_review_echo(review: &str, item: &ThreadItem) -> bool {
    matches!(
        item,
        ThreadItem::Message {
            role: Role::Assistant,
            text,
            ..
        } if text.trim() == review
    )
}

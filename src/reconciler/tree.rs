//! Flattening the thread tree into display rows

use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// One visible row of the thread tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRow {
    pub thread_id: String,
    pub depth: usize,
    pub has_children: bool,
    pub collapsed: bool,
}

/// Depth-first rows for `threads`, given as `(id, parent_id)` in display
/// order. Threads whose parent is unknown are roots. Children of collapsed
/// threads are hidden. Parent cycles are broken by emitting the first
/// unvisited member as a root.
pub fn thread_rows(threads: &[(String, Option<String>)], collapsed: &HashSet<String>) -> Vec<ThreadRow> {
    let known: HashSet<&str> = threads.iter().map(|(id, _)| id.as_str()).collect();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut roots: Vec<&str> = Vec::new();
    for (id, parent) in threads {
        match parent.as_deref() {
            Some(parent) if parent != id.as_str() && known.contains(parent) => {
                children.entry(parent).or_default().push(id);
            }
            _ => roots.push(id),
        }
    }

    let mut rows = Vec::with_capacity(threads.len());
    let mut visited: HashSet<&str> = HashSet::new();
    for root in roots {
        walk(root, 0, &children, collapsed, &mut visited, &mut rows);
    }
    // Whatever is left hangs off a cycle.
    for (id, _) in threads {
        if !visited.contains(id.as_str()) {
            walk(id, 0, &children, collapsed, &mut visited, &mut rows);
        }
    }
    rows
}

fn walk<'a>(
    id: &'a str,
    depth: usize,
    children: &HashMap<&'a str, Vec<&'a str>>,
    collapsed: &HashSet<String>,
    visited: &mut HashSet<&'a str>,
    rows: &mut Vec<ThreadRow>,
) {
    if !visited.insert(id) {
        return;
    }
    let kids = children.get(id).map(Vec::as_slice).unwrap_or_default();
    let is_collapsed = collapsed.contains(id);
    rows.push(ThreadRow {
        thread_id: id.to_string(),
        depth,
        has_children: !kids.is_empty(),
        collapsed: is_collapsed,
    });
    if is_collapsed {
        // Hidden descendants still count as placed.
        mark_visited(id, children, visited);
        return;
    }
    for &child in kids {
        walk(child, depth + 1, children, collapsed, visited, rows);
    }
}

fn mark_visited<'a>(id: &'a str, children: &HashMap<&'a str, Vec<&'a str>>, visited: &mut HashSet<&'a str>) {
    let mut stack: Vec<&'a str> = children.get(id).cloned().unwrap_or_default();
    while let Some(next) = stack.pop() {
        if visited.insert(next) {
            stack.extend(children.get(next).into_iter().flatten().copied());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(id: &str, parent: Option<&str>) -> (String, Option<String>) {
        (id.to_string(), parent.map(str::to_string))
    }

    fn layout(rows: &[ThreadRow]) -> Vec<(&str, usize)> {
        rows.iter().map(|row| (row.thread_id.as_str(), row.depth)).collect()
    }

    #[test]
    fn test_depth_first_order() {
        let threads = vec![
            entry("a", None),
            entry("b", None),
            entry("a1", Some("a")),
            entry("a1x", Some("a1")),
            entry("a2", Some("a")),
        ];
        let rows = thread_rows(&threads, &HashSet::new());
        assert_eq!(
            layout(&rows),
            vec![("a", 0), ("a1", 1), ("a1x", 2), ("a2", 1), ("b", 0)]
        );
        assert!(rows[0].has_children);
        assert!(!rows[4].has_children);
    }

    #[test]
    fn test_collapsed_hides_descendants() {
        let threads = vec![entry("a", None), entry("a1", Some("a")), entry("a1x", Some("a1"))];
        let collapsed: HashSet<String> = ["a".to_string()].into_iter().collect();
        let rows = thread_rows(&threads, &collapsed);
        assert_eq!(layout(&rows), vec![("a", 0)]);
        assert!(rows[0].collapsed);
    }

    #[test]
    fn test_unknown_parent_is_root() {
        let rows = thread_rows(&[entry("orphan", Some("gone"))], &HashSet::new());
        assert_eq!(layout(&rows), vec![("orphan", 0)]);
    }

    #[test]
    fn test_cycles_terminate() {
        let threads = vec![entry("x", Some("y")), entry("y", Some("x"))];
        let rows = thread_rows(&threads, &HashSet::new());
        assert_eq!(layout(&rows), vec![("x", 0), ("y", 1)]);
    }
}

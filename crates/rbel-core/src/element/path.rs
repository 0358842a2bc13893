//! Path queries over the child view.
//!
//! Supported syntax:
//!
//! - `$` selects the root
//! - `.name` selects children with that key
//! - `.*` selects all children
//! - `..name` selects descendants (any depth) with that key

use super::{NodeId, RbelElement, RbelMessage};

#[derive(Debug, PartialEq, Eq)]
enum Step<'a> {
    Child(&'a str),
    Descendant(&'a str),
}

fn parse(path: &str) -> Option<Vec<Step<'_>>> {
    let rest = path.strip_prefix('$')?;
    let mut steps = Vec::new();
    let mut remaining = rest;
    while !remaining.is_empty() {
        let (descendant, tail) = if let Some(t) = remaining.strip_prefix("..") {
            (true, t)
        } else if let Some(t) = remaining.strip_prefix('.') {
            (false, t)
        } else {
            return None;
        };
        let end = tail.find('.').unwrap_or(tail.len());
        let name = &tail[..end];
        if name.is_empty() {
            return None;
        }
        steps.push(if descendant {
            Step::Descendant(name)
        } else {
            Step::Child(name)
        });
        remaining = &tail[end..];
    }
    Some(steps)
}

impl RbelMessage {
    /// Evaluates a path and returns all matching elements in document order.
    ///
    /// An unparsable path matches nothing.
    pub fn find_by_path(&self, path: &str) -> Vec<NodeId> {
        let Some(steps) = parse(path) else {
            tracing::debug!("Ignoring malformed path {:?}", path);
            return Vec::new();
        };

        let mut current = vec![NodeId::ROOT];
        for step in steps {
            let mut next = Vec::new();
            for node in current {
                match step {
                    Step::Child(name) => self.collect_children(node, name, &mut next),
                    Step::Descendant(name) => self.collect_descendants(node, name, &mut next),
                }
            }
            next.dedup();
            current = next;
        }
        current
    }

    /// First element matching a path.
    pub fn find_first(&self, path: &str) -> Option<&RbelElement> {
        self.find_by_path(path)
            .first()
            .map(|id| self.element(*id))
    }

    /// All elements (any depth) whose key equals `key`.
    pub fn find_all(&self, key: &str) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_descendants(NodeId::ROOT, key, &mut out);
        out
    }

    fn collect_children(&self, node: NodeId, name: &str, out: &mut Vec<NodeId>) {
        for (key, child) in self.children(node) {
            if name == "*" || key == name {
                out.push(child);
            }
        }
    }

    fn collect_descendants(&self, node: NodeId, name: &str, out: &mut Vec<NodeId>) {
        for (key, child) in self.children(node) {
            if name == "*" || key == name {
                out.push(child);
            }
            self.collect_descendants(child, name, out);
        }
    }
}

//! Plain-text rendering of a parse tree.

use std::fmt::Write;

use super::{FacetKind, NodeId, RbelMessage};

/// Content longer than this is shortened in the rendering.
const PREVIEW_LEN: usize = 60;

impl RbelMessage {
    /// Renders the tree as indented text, one element per line.
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "message {} #{} ({} bytes)",
            self.uuid(),
            self.metadata().sequence_number,
            self.size()
        );
        self.render_node(NodeId::ROOT, "$", 0, &mut out);
        out
    }

    fn render_node(&self, id: NodeId, key: &str, indent: usize, out: &mut String) {
        let element = self.element(id);
        let facets: Vec<String> = element
            .facets()
            .iter()
            .filter(|f| f.kind() != FacetKind::Value)
            .map(|f| f.summary())
            .collect();
        let _ = write!(out, "{:indent$}{}", "", key, indent = indent * 2);
        if facets.is_empty() {
            let _ = write!(out, " = {}", preview(&element.content_lossy()));
        } else {
            let _ = write!(out, " [{}]", facets.join(", "));
        }
        out.push('\n');

        for (child_key, child) in self.children(id) {
            self.render_node(child, &child_key, indent + 1, out);
        }
    }
}

fn preview(text: &str) -> String {
    let single_line: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if single_line.chars().count() > PREVIEW_LEN {
        let cut: String = single_line.chars().take(PREVIEW_LEN).collect();
        format!("{:?}...", cut)
    } else {
        format!("{:?}", single_line)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::element::{Facet, MessageMetadata};

    #[test]
    fn renders_keys_and_facets() {
        let mut msg = RbelMessage::new(&b"aGVsbG8="[..], MessageMetadata::new());
        let decoded = msg.push_child(NodeId::ROOT, "decoded", Bytes::from_static(b"hello"));
        msg.add_facet(
            NodeId::ROOT,
            Facet::Base64 {
                decoded,
                url_safe: false,
            },
        );
        let text = msg.render_tree();
        assert!(text.contains("$ [base64]"));
        assert!(text.contains("  decoded = \"hello\""));
    }

    #[test]
    fn preview_truncates() {
        let long = "x".repeat(200);
        assert!(preview(&long).ends_with("..."));
        assert_eq!(preview("a\nb"), "\"a b\"");
    }
}

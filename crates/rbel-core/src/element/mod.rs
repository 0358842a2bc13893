//! Parse-tree model.
//!
//! A message is an arena of elements. The root is always at index 0; every
//! other element records its parent as an index, so there are no ownership
//! cycles and a finished message can be shared read-only behind an `Arc`.
//!
//! ```text
//! RbelMessage
//!   elements[0]  root          facets: HttpMessage { header: 1, body: 4 }
//!   elements[1]  "header"      parent: 0
//!   ...
//!   elements[4]  "body"        parent: 0, facets: Json { ... }
//! ```

mod facet;
mod path;
mod render;

pub use facet::{Facet, FacetKind, HandshakeStage, JsonShape, NoteSeverity};

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Index of an element inside its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// The root element of every message.
    pub const ROOT: NodeId = NodeId(0);

    /// Creates an id from a raw index.
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the raw index.
    pub fn index(self) -> usize {
        self.0
    }
}

/// A single node of the parse tree.
#[derive(Debug, Clone)]
pub struct RbelElement {
    content: Bytes,
    key: Option<String>,
    parent: Option<NodeId>,
    depth: usize,
    facets: Vec<Facet>,
}

impl RbelElement {
    fn new(content: Bytes, key: Option<String>, parent: Option<NodeId>, depth: usize) -> Self {
        Self {
            content,
            key,
            parent,
            depth,
            facets: Vec::new(),
        }
    }

    /// Raw content bytes.
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Content as UTF-8, if valid.
    pub fn content_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }

    /// Content as lossy UTF-8.
    pub fn content_lossy(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }

    /// Name of this element in its parent's child collection.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Parent element, `None` for the root.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Nesting depth (root = 0).
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Size of the raw content in bytes.
    pub fn size(&self) -> usize {
        self.content.len()
    }

    /// All attached facets.
    pub fn facets(&self) -> &[Facet] {
        &self.facets
    }

    /// First facet of the given kind.
    pub fn facet(&self, kind: FacetKind) -> Option<&Facet> {
        self.facets.iter().find(|f| f.kind() == kind)
    }

    /// Returns true if a facet of the given kind is attached.
    pub fn has_facet(&self, kind: FacetKind) -> bool {
        self.facet(kind).is_some()
    }

    /// Text of all notes attached to this element.
    pub fn notes(&self) -> Vec<&str> {
        self.facets
            .iter()
            .filter_map(|f| match f {
                Facet::Note { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Capture metadata of a message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageMetadata {
    /// Message identifier.
    pub uuid: Uuid,
    /// Identifier of the message written before this one on the same connection.
    pub previous_uuid: Option<Uuid>,
    /// Position in the conversion order.
    pub sequence_number: u64,
    /// Sending endpoint.
    pub sender: Option<SocketAddr>,
    /// Receiving endpoint.
    pub receiver: Option<SocketAddr>,
    /// Capture time of the first contributing segment.
    pub timestamp: DateTime<Utc>,
    /// For responses: the request this message answers.
    pub paired_request: Option<Uuid>,
    /// Uuids of the raw segments this message was assembled from.
    pub source_uuids: Vec<Uuid>,
    /// Free-form metadata from the capture layer.
    pub extra: BTreeMap<String, String>,
}

impl MessageMetadata {
    /// Creates metadata with a fresh random uuid and the current time.
    pub fn new() -> Self {
        Self::with_uuid(Uuid::new_v4())
    }

    /// Creates metadata for a known uuid.
    pub fn with_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            previous_uuid: None,
            sequence_number: 0,
            sender: None,
            receiver: None,
            timestamp: Utc::now(),
            paired_request: None,
            source_uuids: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Sets sender and receiver.
    pub fn with_endpoints(mut self, sender: SocketAddr, receiver: SocketAddr) -> Self {
        self.sender = Some(sender);
        self.receiver = Some(receiver);
        self
    }

    /// Sets the paired request.
    pub fn with_paired_request(mut self, request: Uuid) -> Self {
        self.paired_request = Some(request);
        self
    }
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// A parsed message: root element plus all descendants.
#[derive(Debug, Clone)]
pub struct RbelMessage {
    metadata: MessageMetadata,
    elements: Vec<RbelElement>,
}

impl RbelMessage {
    /// Creates an unconverted message holding only the root element.
    pub fn new(content: impl Into<Bytes>, metadata: MessageMetadata) -> Self {
        Self {
            metadata,
            elements: vec![RbelElement::new(content.into(), None, None, 0)],
        }
    }

    /// Capture metadata.
    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    /// Mutable capture metadata (pre-conversion hooks use this).
    pub fn metadata_mut(&mut self) -> &mut MessageMetadata {
        &mut self.metadata
    }

    /// Message identifier.
    pub fn uuid(&self) -> Uuid {
        self.metadata.uuid
    }

    /// The root element.
    pub fn root(&self) -> &RbelElement {
        &self.elements[0]
    }

    /// Raw bytes of the whole message.
    pub fn raw(&self) -> &Bytes {
        self.root().content()
    }

    /// Size of the raw message in bytes.
    pub fn size(&self) -> usize {
        self.root().size()
    }

    /// Number of elements in the tree.
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// Element by id.
    ///
    /// # Panics
    /// If the id does not belong to this message.
    pub fn element(&self, id: NodeId) -> &RbelElement {
        &self.elements[id.0]
    }

    /// Element by id, `None` when out of range.
    pub fn get(&self, id: NodeId) -> Option<&RbelElement> {
        self.elements.get(id.0)
    }

    /// Appends a child and returns its id.
    ///
    /// The child only becomes visible in the child view once a facet on the
    /// parent references it.
    pub(crate) fn push_child(&mut self, parent: NodeId, key: &str, content: Bytes) -> NodeId {
        let depth = self.elements[parent.0].depth + 1;
        let id = NodeId(self.elements.len());
        self.elements.push(RbelElement::new(
            content,
            Some(key.to_string()),
            Some(parent),
            depth,
        ));
        id
    }

    /// Attaches a facet to an element.
    pub fn add_facet(&mut self, id: NodeId, facet: Facet) {
        self.elements[id.0].facets.push(facet);
    }

    /// Mutable access to the facets of an element.
    pub(crate) fn facets_mut(&mut self, id: NodeId) -> &mut Vec<Facet> {
        &mut self.elements[id.0].facets
    }

    /// Attaches a note to an element.
    pub fn add_note(&mut self, id: NodeId, severity: NoteSeverity, text: impl Into<String>) {
        self.add_facet(
            id,
            Facet::Note {
                severity,
                text: text.into(),
            },
        );
    }

    /// Ordered child view of an element, merged over all facets.
    pub fn children(&self, id: NodeId) -> Vec<(String, NodeId)> {
        self.elements[id.0]
            .facets
            .iter()
            .flat_map(|f| f.children())
            .collect()
    }

    /// First child with the given key.
    pub fn child(&self, id: NodeId, key: &str) -> Option<NodeId> {
        self.elements[id.0]
            .facets
            .iter()
            .flat_map(|f| f.children())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// All children with the given key (header and form multimaps).
    pub fn children_named(&self, id: NodeId, key: &str) -> Vec<NodeId> {
        self.children(id)
            .into_iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v)
            .collect()
    }

    /// Path of an element from the root, e.g. `$.body.header.alg`.
    pub fn path_of(&self, id: NodeId) -> String {
        let mut keys = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current {
            let element = &self.elements[node.0];
            if let Some(key) = &element.key {
                keys.push(key.as_str());
            }
            current = element.parent;
        }
        keys.reverse();
        if keys.is_empty() {
            "$".to_string()
        } else {
            format!("$.{}", keys.join("."))
        }
    }

    /// Ids of all elements carrying a facet of the given kind.
    pub fn elements_with_facet(&self, kind: FacetKind) -> Vec<NodeId> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, e)| e.has_facet(kind))
            .map(|(i, _)| NodeId(i))
            .collect()
    }

    /// Looks up the header values of an HTTP message element.
    pub fn header_values(&self, message: NodeId, name: &str) -> Vec<NodeId> {
        let Some(Facet::HttpMessage { header, .. }) =
            self.element(message).facet(FacetKind::HttpMessage)
        else {
            return Vec::new();
        };
        match self.element(*header).facet(FacetKind::HttpHeaders) {
            Some(Facet::HttpHeaders { entries }) => entries
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| *v)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// First header value of an HTTP message element, as text.
    pub fn header_value(&self, message: NodeId, name: &str) -> Option<String> {
        self.header_values(message, name)
            .first()
            .map(|id| self.element(*id).content_lossy())
    }

    /// Body element of an HTTP message element.
    pub fn http_body(&self, message: NodeId) -> Option<NodeId> {
        match self.element(message).facet(FacetKind::HttpMessage) {
            Some(Facet::HttpMessage { body, .. }) => Some(*body),
            _ => None,
        }
    }
}

//! Facets: typed interpretations attached to an element.
//!
//! An element can carry several facets at once (an HTTP body can be both a
//! base64 string and, one level down, JSON). Each facet names its children;
//! the element's child view is the ordered merge of all of them.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::NodeId;

/// Tag identifying a facet variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacetKind {
    HttpMessage,
    HttpRequest,
    HttpResponse,
    HttpHeaders,
    Uri,
    Json,
    Form,
    Base64,
    Compressed,
    Jwt,
    Jwe,
    VauHandshake,
    VauEncrypted,
    Note,
    Value,
}

impl FacetKind {
    /// Returns the kind as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpMessage => "http_message",
            Self::HttpRequest => "http_request",
            Self::HttpResponse => "http_response",
            Self::HttpHeaders => "http_headers",
            Self::Uri => "uri",
            Self::Json => "json",
            Self::Form => "form",
            Self::Base64 => "base64",
            Self::Compressed => "compressed",
            Self::Jwt => "jwt",
            Self::Jwe => "jwe",
            Self::VauHandshake => "vau_handshake",
            Self::VauEncrypted => "vau_encrypted",
            Self::Note => "note",
            Self::Value => "value",
        }
    }
}

impl fmt::Display for FacetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Severity of a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteSeverity {
    Info,
    Warn,
    Error,
}

/// Shape of a JSON container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonShape {
    Object,
    Array,
}

/// Handshake stage of a VAU session message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeStage {
    M1,
    M2,
    M3,
    M4,
}

impl HandshakeStage {
    /// Parses the `MessageType` value of a handshake message.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "M1" => Some(Self::M1),
            "M2" => Some(Self::M2),
            "M3" => Some(Self::M3),
            "M4" => Some(Self::M4),
            _ => None,
        }
    }

    /// Returns true for stages sent by the client.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::M1 | Self::M3)
    }
}

/// A typed interpretation of an element.
#[derive(Debug, Clone, PartialEq)]
pub enum Facet {
    /// An HTTP message split into header block and body.
    HttpMessage { header: NodeId, body: NodeId },
    /// Request line of an HTTP request.
    HttpRequest {
        method: NodeId,
        path: NodeId,
        version: String,
    },
    /// Status line of an HTTP response.
    HttpResponse {
        status: NodeId,
        status_code: u16,
        reason: String,
        version: String,
    },
    /// Header block; repeated names are kept in order.
    HttpHeaders { entries: Vec<(String, NodeId)> },
    /// Request target with decoded query parameters.
    Uri {
        path: String,
        parameters: Vec<(String, NodeId)>,
    },
    /// JSON object or array; array members are keyed by index.
    Json {
        shape: JsonShape,
        entries: Vec<(String, NodeId)>,
    },
    /// `application/x-www-form-urlencoded` body.
    Form { parameters: Vec<(String, NodeId)> },
    /// Base64 text and its decoded bytes.
    Base64 { decoded: NodeId, url_safe: bool },
    /// gzip/deflate compressed bytes and the inflated content.
    Compressed { encoding: String, decoded: NodeId },
    /// Compact JWS.
    Jwt {
        header: NodeId,
        body: NodeId,
        signature: NodeId,
        verified_with: Option<String>,
    },
    /// Compact JWE; `body` is present once decrypted.
    Jwe {
        header: NodeId,
        encrypted_key: NodeId,
        iv: NodeId,
        ciphertext: NodeId,
        tag: NodeId,
        body: Option<NodeId>,
        decrypted_with: Option<String>,
    },
    /// A handshake message correlated to a VAU session.
    VauHandshake {
        stage: HandshakeStage,
        session_id: String,
        key_id: Option<String>,
    },
    /// A decrypted VAU data message.
    VauEncrypted {
        version: u8,
        pu: bool,
        is_request: bool,
        request_counter: u64,
        key_id: String,
        key_name: String,
        session_id: Option<String>,
        decrypted: NodeId,
    },
    /// Free text annotation (e.g. a converter failure).
    Note { severity: NoteSeverity, text: String },
    /// A scalar leaf value.
    Value(serde_json::Value),
}

impl Facet {
    /// Returns the tag of this facet.
    pub fn kind(&self) -> FacetKind {
        match self {
            Self::HttpMessage { .. } => FacetKind::HttpMessage,
            Self::HttpRequest { .. } => FacetKind::HttpRequest,
            Self::HttpResponse { .. } => FacetKind::HttpResponse,
            Self::HttpHeaders { .. } => FacetKind::HttpHeaders,
            Self::Uri { .. } => FacetKind::Uri,
            Self::Json { .. } => FacetKind::Json,
            Self::Form { .. } => FacetKind::Form,
            Self::Base64 { .. } => FacetKind::Base64,
            Self::Compressed { .. } => FacetKind::Compressed,
            Self::Jwt { .. } => FacetKind::Jwt,
            Self::Jwe { .. } => FacetKind::Jwe,
            Self::VauHandshake { .. } => FacetKind::VauHandshake,
            Self::VauEncrypted { .. } => FacetKind::VauEncrypted,
            Self::Note { .. } => FacetKind::Note,
            Self::Value(_) => FacetKind::Value,
        }
    }

    /// Returns the named children contributed by this facet.
    pub fn children(&self) -> Vec<(String, NodeId)> {
        fn named(pairs: &[(&str, NodeId)]) -> Vec<(String, NodeId)> {
            pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
        }

        match self {
            Self::HttpMessage { header, body } => named(&[("header", *header), ("body", *body)]),
            Self::HttpRequest { method, path, .. } => {
                named(&[("method", *method), ("path", *path)])
            }
            Self::HttpResponse { status, .. } => named(&[("responseCode", *status)]),
            Self::HttpHeaders { entries } => entries.clone(),
            Self::Uri { parameters, .. } => parameters.clone(),
            Self::Json { entries, .. } => entries.clone(),
            Self::Form { parameters } => parameters.clone(),
            Self::Base64 { decoded, .. } => named(&[("decoded", *decoded)]),
            Self::Compressed { decoded, .. } => named(&[("decoded", *decoded)]),
            Self::Jwt {
                header,
                body,
                signature,
                ..
            } => named(&[
                ("header", *header),
                ("body", *body),
                ("signature", *signature),
            ]),
            Self::Jwe {
                header,
                encrypted_key,
                iv,
                ciphertext,
                tag,
                body,
                ..
            } => {
                let mut children = named(&[
                    ("header", *header),
                    ("encryptedKey", *encrypted_key),
                    ("iv", *iv),
                    ("ciphertext", *ciphertext),
                    ("tag", *tag),
                ]);
                if let Some(body) = body {
                    children.push(("body".to_string(), *body));
                }
                children
            }
            Self::VauEncrypted { decrypted, .. } => named(&[("decrypted", *decrypted)]),
            Self::VauHandshake { .. } | Self::Note { .. } | Self::Value(_) => Vec::new(),
        }
    }

    /// Short one-line summary used by the tree renderer.
    pub fn summary(&self) -> String {
        match self {
            Self::HttpRequest { version, .. } => format!("http request ({})", version),
            Self::HttpResponse {
                status_code,
                reason,
                ..
            } => format!("http response {} {}", status_code, reason),
            Self::Uri { path, parameters } => {
                format!("uri {} ({} params)", path, parameters.len())
            }
            Self::Compressed { encoding, .. } => format!("compressed ({})", encoding),
            Self::Jwt { verified_with, .. } => match verified_with {
                Some(key) => format!("jwt (verified with {})", key),
                None => "jwt".to_string(),
            },
            Self::Jwe { decrypted_with, .. } => match decrypted_with {
                Some(key) => format!("jwe (decrypted with {})", key),
                None => "jwe".to_string(),
            },
            Self::VauHandshake {
                stage, session_id, ..
            } => format!("vau handshake {:?} session {}", stage, short(session_id)),
            Self::VauEncrypted {
                request_counter,
                key_name,
                ..
            } => format!("vau encrypted #{} key {}", request_counter, key_name),
            Self::Note { severity, text } => format!("note[{:?}] {}", severity, text),
            Self::Value(v) => format!("value {}", v),
            other => other.kind().to_string(),
        }
    }
}

fn short(s: &str) -> &str {
    s.get(..12).unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_message_children_in_order() {
        let facet = Facet::HttpMessage {
            header: NodeId::new(1),
            body: NodeId::new(2),
        };
        let children = facet.children();
        assert_eq!(children[0], ("header".to_string(), NodeId::new(1)));
        assert_eq!(children[1], ("body".to_string(), NodeId::new(2)));
        assert_eq!(facet.kind(), FacetKind::HttpMessage);
    }

    #[test]
    fn jwe_body_only_after_decryption() {
        let mut facet = Facet::Jwe {
            header: NodeId::new(1),
            encrypted_key: NodeId::new(2),
            iv: NodeId::new(3),
            ciphertext: NodeId::new(4),
            tag: NodeId::new(5),
            body: None,
            decrypted_with: None,
        };
        assert_eq!(facet.children().len(), 5);
        if let Facet::Jwe { body, .. } = &mut facet {
            *body = Some(NodeId::new(6));
        }
        assert_eq!(facet.children().len(), 6);
    }

    #[test]
    fn handshake_stage_parse() {
        assert_eq!(HandshakeStage::parse("M2"), Some(HandshakeStage::M2));
        assert_eq!(HandshakeStage::parse("M5"), None);
        assert!(HandshakeStage::M3.is_request());
        assert!(!HandshakeStage::M4.is_request());
    }

    #[test]
    fn kind_serialization() {
        assert_eq!(
            serde_json::to_string(&FacetKind::VauEncrypted).unwrap(),
            "\"vau_encrypted\""
        );
    }
}

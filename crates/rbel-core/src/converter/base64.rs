//! Base64 text (standard and URL-safe alphabets).

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use bytes::Bytes;

use super::{ConversionContext, Converter};
use crate::element::{Facet, FacetKind, NodeId};
use crate::error::ConversionError;

const MIN_ENCODED_LEN: usize = 8;
const MIN_DECODED_LEN: usize = 4;

/// Magic prefixes accepted for binary decoded content.
const KNOWN_MAGIC: &[&[u8]] = &[
    &[0x1f, 0x8b],       // gzip
    &[0x30, 0x82],       // DER sequence
    b"%PDF",
    &[0x89, b'P', b'N', b'G'],
];

/// Facets that mean an element is already understood as something else.
const STRUCTURAL: &[FacetKind] = &[
    FacetKind::HttpMessage,
    FacetKind::HttpHeaders,
    FacetKind::Uri,
    FacetKind::Json,
    FacetKind::Form,
    FacetKind::Base64,
    FacetKind::Compressed,
    FacetKind::Jwt,
    FacetKind::Jwe,
    FacetKind::VauEncrypted,
];

/// Returns true if more than a tenth of the leading bytes are NUL or control
/// characters other than tab, CR and LF.
pub(crate) fn is_binary_content(body: &[u8]) -> bool {
    if body.is_empty() {
        return false;
    }
    let sample = &body[..body.len().min(512)];
    let threshold = sample.len() / 10;
    let nul = sample.iter().filter(|&&b| b == 0).count();
    let control = sample
        .iter()
        .filter(|&&b| b < 32 && b != b'\t' && b != b'\n' && b != b'\r')
        .count();
    nul > threshold || control > threshold
}

/// Decodes `text` if it is entirely base64. Returns the bytes and whether
/// the URL-safe alphabet was used.
fn decode(text: &str) -> Option<(Vec<u8>, bool)> {
    let url_safe = text.contains(['-', '_']);
    let standard = text.contains(['+', '/']);
    if url_safe && standard {
        return None;
    }
    let engines = if url_safe {
        [URL_SAFE, URL_SAFE_NO_PAD]
    } else {
        [STANDARD, STANDARD_NO_PAD]
    };
    engines
        .iter()
        .find_map(|engine| engine.decode(text).ok())
        .map(|decoded| (decoded, url_safe))
}

fn is_interesting(decoded: &[u8]) -> bool {
    if KNOWN_MAGIC.iter().any(|magic| decoded.starts_with(magic)) {
        return true;
    }
    std::str::from_utf8(decoded).is_ok() && !is_binary_content(decoded)
}

/// Decodes base64 strings whose content is text or a known binary format.
#[derive(Debug, Default)]
pub struct Base64Converter;

impl Converter for Base64Converter {
    fn name(&self) -> &'static str {
        "base64"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["json"]
    }

    fn consider(
        &self,
        ctx: &mut ConversionContext<'_>,
        node: NodeId,
    ) -> Result<bool, ConversionError> {
        let element = ctx.message().element(node);
        if STRUCTURAL.iter().any(|kind| element.has_facet(*kind)) {
            return Ok(false);
        }
        let Some(text) = element.content_str().map(str::trim) else {
            return Ok(false);
        };
        if text.len() < MIN_ENCODED_LEN {
            return Ok(false);
        }
        let Some((decoded, url_safe)) = decode(text) else {
            return Ok(false);
        };
        if decoded.len() < MIN_DECODED_LEN || !is_interesting(&decoded) {
            return Ok(false);
        }

        let decoded = ctx.add_child(node, "decoded", Bytes::from(decoded));
        ctx.add_facet(node, Facet::Base64 { decoded, url_safe });
        ctx.convert(decoded);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RbelConfig;
    use crate::converter::RbelConverter;
    use crate::element::MessageMetadata;

    #[test]
    fn binary_heuristic() {
        assert!(!is_binary_content(b"Hello, world!"));
        assert!(!is_binary_content(b"{\"key\": \"value\"}"));
        assert!(is_binary_content(&[0x00, 0x01, 0x02, 0x03, 0x00, 0x00, 0x00, 0x00]));
    }

    #[test]
    fn decodes_both_alphabets() {
        assert_eq!(decode("aGVsbG8gd29ybGQ=").unwrap(), (b"hello world".to_vec(), false));
        assert_eq!(decode("aGVsbG8gd29ybGQ").unwrap(), (b"hello world".to_vec(), false));
        assert_eq!(decode("Pz8_").unwrap(), (b"???".to_vec(), true));
        assert!(decode("a+b_").is_none());
        assert!(decode("not base64!").is_none());
    }

    #[test]
    fn nested_json_in_base64() {
        let converter = RbelConverter::new(RbelConfig::default()).unwrap();
        // {"sub":"alice"}
        let msg = converter.parse_message(
            &br#"{"token":"eyJzdWIiOiJhbGljZSJ9"}"#[..],
            MessageMetadata::new(),
        );
        let sub = msg.find_first("$.token.decoded.sub").unwrap();
        assert_eq!(sub.content().as_ref(), b"alice");
    }

    #[test]
    fn binary_garbage_is_not_decoded() {
        let converter = RbelConverter::new(RbelConfig::default()).unwrap();
        // Decodes to bytes that are not UTF-8.
        let msg = converter.parse_message(&b"//79/Pv6+fg="[..], MessageMetadata::new());
        assert!(!msg.root().has_facet(FacetKind::Base64));
    }
}

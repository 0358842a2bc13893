//! Compact JWS (`header.payload.signature`).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::{ConversionContext, Converter};
use crate::element::{Facet, FacetKind, NodeId, NoteSeverity};
use crate::error::ConversionError;
use crate::keys::{KeyKind, RbelKeyManager};

type HmacSha256 = Hmac<Sha256>;

pub(crate) fn is_base64url(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'=')
}

pub(crate) fn decode_segment(s: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(s.trim_end_matches('=')).ok()
}

/// Decodes a protected header and returns it if it is a JSON object.
pub(crate) fn decode_header(s: &str) -> Option<(Vec<u8>, serde_json::Map<String, serde_json::Value>)> {
    let raw = decode_segment(s)?;
    match serde_json::from_slice(&raw).ok()? {
        serde_json::Value::Object(map) => Some((raw, map)),
        _ => None,
    }
}

/// Name of the first symmetric key whose HMAC-SHA256 matches.
fn verify_hs256(keys: &RbelKeyManager, signing_input: &[u8], signature: &[u8]) -> Option<String> {
    keys.get_all_keys()
        .into_iter()
        .filter(|k| matches!(k.kind(), KeyKind::Symmetric { .. }))
        .find(|key| {
            let Ok(mut mac) = HmacSha256::new_from_slice(key.material()) else {
                return false;
            };
            mac.update(signing_input);
            mac.verify_slice(signature).is_ok()
        })
        .map(|key| key.name().to_string())
}

/// Splits JWTs and verifies HS256 signatures.
#[derive(Debug, Default)]
pub struct JwtConverter;

impl Converter for JwtConverter {
    fn name(&self) -> &'static str {
        "jwt"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["json", "base64"]
    }

    fn consider(
        &self,
        ctx: &mut ConversionContext<'_>,
        node: NodeId,
    ) -> Result<bool, ConversionError> {
        let element = ctx.message().element(node);
        if element.has_facet(FacetKind::Jwt) {
            return Ok(false);
        }
        let Some(text) = element.content_str().map(|s| s.trim().to_string()) else {
            return Ok(false);
        };
        let parts: Vec<&str> = text.split('.').collect();
        if parts.len() != 3
            || parts[0].is_empty()
            || parts[1].is_empty()
            || !parts.iter().all(|p| is_base64url(p))
        {
            return Ok(false);
        }
        let Some((header, header_json)) = decode_header(parts[0]) else {
            return Ok(false);
        };
        let Some(alg) = header_json.get("alg").and_then(|v| v.as_str()) else {
            return Ok(false);
        };
        let body = decode_segment(parts[1])
            .ok_or_else(|| ConversionError::new("JWT payload is not base64url"))?;
        let signature = decode_segment(parts[2])
            .ok_or_else(|| ConversionError::new("JWT signature is not base64url"))?;

        let verified_with = if alg == "HS256" {
            let signing_input = format!("{}.{}", parts[0], parts[1]);
            verify_hs256(ctx.keys(), signing_input.as_bytes(), &signature)
        } else {
            None
        };

        let header = ctx.add_child(node, "header", Bytes::from(header));
        let body = ctx.add_child(node, "body", Bytes::from(body));
        let signature = ctx.add_child(node, "signature", Bytes::from(signature));
        ctx.add_facet(node, Facet::Jwt {
            header,
            body,
            signature,
            verified_with: verified_with.clone(),
        });
        match &verified_with {
            Some(key) => ctx.add_note(signature, NoteSeverity::Info, format!("verified with key {}", key)),
            None => ctx.add_note(signature, NoteSeverity::Info, "not verified"),
        }
        ctx.convert(header);
        ctx.convert(body);
        Ok(true)
    }
}

//! Compact JWE (`header.encryptedKey.iv.ciphertext.tag`).
//!
//! Only direct encryption with `A256GCM` is decrypted; other algorithms are
//! split into their parts and left encrypted.

use bytes::Bytes;

use super::jwt::{decode_header, decode_segment, is_base64url};
use super::{ConversionContext, Converter};
use crate::aead;
use crate::element::{Facet, FacetKind, NodeId, NoteSeverity};
use crate::error::ConversionError;
use crate::keys::{KeyKind, RbelKeyManager};

/// Tries every 32-byte symmetric key in precedence order.
fn decrypt_direct(
    keys: &RbelKeyManager,
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Option<(String, Vec<u8>)> {
    let mut sealed = Vec::with_capacity(ciphertext.len() + tag.len());
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);
    keys.get_all_keys()
        .into_iter()
        .filter(|k| {
            matches!(k.kind(), KeyKind::Symmetric { .. }) && k.material().len() == aead::KEY_SIZE
        })
        .find_map(|key| {
            aead::decrypt(key.material(), iv, aad, &sealed).map(|plain| (key.name().to_string(), plain))
        })
}

/// Splits JWEs and decrypts `dir`/`A256GCM` tokens.
#[derive(Debug, Default)]
pub struct JweConverter;

impl Converter for JweConverter {
    fn name(&self) -> &'static str {
        "jwe"
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
        if element.has_facet(FacetKind::Jwe) {
            return Ok(false);
        }
        let Some(text) = element.content_str().map(|s| s.trim().to_string()) else {
            return Ok(false);
        };
        let parts: Vec<&str> = text.split('.').collect();
        if parts.len() != 5 || parts[0].is_empty() || !parts.iter().all(|p| is_base64url(p)) {
            return Ok(false);
        }
        let Some((header, header_json)) = decode_header(parts[0]) else {
            return Ok(false);
        };
        let Some(enc) = header_json.get("enc").and_then(|v| v.as_str()) else {
            return Ok(false);
        };
        let alg = header_json.get("alg").and_then(|v| v.as_str()).unwrap_or("");

        let segment = |i: usize, what: &str| {
            decode_segment(parts[i])
                .ok_or_else(|| ConversionError::new(format!("JWE {} is not base64url", what)))
        };
        let encrypted_key = segment(1, "encrypted key")?;
        let iv = segment(2, "iv")?;
        let ciphertext = segment(3, "ciphertext")?;
        let tag = segment(4, "tag")?;

        let decrypted = if alg == "dir" && enc == "A256GCM" {
            decrypt_direct(ctx.keys(), &iv, &ciphertext, &tag, parts[0].as_bytes())
        } else {
            None
        };

        let header = ctx.add_child(node, "header", Bytes::from(header));
        let encrypted_key = ctx.add_child(node, "encryptedKey", Bytes::from(encrypted_key));
        let iv = ctx.add_child(node, "iv", Bytes::from(iv));
        let ciphertext = ctx.add_child(node, "ciphertext", Bytes::from(ciphertext));
        let tag = ctx.add_child(node, "tag", Bytes::from(tag));
        let (body, decrypted_with) = match decrypted {
            Some((key, plain)) => (Some(ctx.add_child(node, "body", Bytes::from(plain))), Some(key)),
            None => (None, None),
        };
        ctx.add_facet(node, Facet::Jwe {
            header,
            encrypted_key,
            iv,
            ciphertext,
            tag,
            body,
            decrypted_with,
        });
        ctx.convert(header);
        match body {
            Some(body) => ctx.convert(body),
            None => ctx.add_note(node, NoteSeverity::Info, "no matching key for JWE"),
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    use super::*;
    use crate::config::RbelConfig;
    use crate::converter::{ConverterRegistry, RbelConverter};
    use crate::element::MessageMetadata;
    use crate::keys::{RbelKey, PRECEDENCE_KEY_FOLDER};

    const KEY: [u8; 32] = [7; 32];

    fn seal(key: &[u8], header: &str, payload: &[u8]) -> String {
        let h = URL_SAFE_NO_PAD.encode(header);
        let iv = [3u8; aead::NONCE_SIZE];
        let sealed = aead::encrypt(key, &iv, h.as_bytes(), payload).unwrap();
        let (ct, tag) = sealed.split_at(sealed.len() - aead::TAG_SIZE);
        format!(
            "{}..{}.{}.{}",
            h,
            URL_SAFE_NO_PAD.encode(iv),
            URL_SAFE_NO_PAD.encode(ct),
            URL_SAFE_NO_PAD.encode(tag)
        )
    }

    fn converter() -> RbelConverter {
        let keys = Arc::new(RbelKeyManager::new());
        keys.add_key(RbelKey::symmetric("wrong", vec![9; 32], "AES-GCM", 0));
        keys.add_key(RbelKey::symmetric(
            "session",
            KEY.to_vec(),
            "AES-GCM",
            PRECEDENCE_KEY_FOLDER,
        ));
        RbelConverter::with_registry(RbelConfig::default(), &ConverterRegistry::with_defaults(), keys)
            .unwrap()
    }

    #[test]
    fn decrypts_direct_a256gcm() {
        let token = seal(&KEY, r#"{"alg":"dir","enc":"A256GCM"}"#, br#"{"code":"abc"}"#);
        let msg = converter().parse_message(token.into_bytes(), MessageMetadata::new());
        match msg.root().facet(FacetKind::Jwe) {
            Some(Facet::Jwe { decrypted_with, .. }) => {
                assert_eq!(decrypted_with.as_deref(), Some("session"));
            }
            other => panic!("unexpected facet {:?}", other),
        }
        assert_eq!(msg.find_first("$.body.code").unwrap().content().as_ref(), b"abc");
        assert_eq!(msg.find_first("$.header.enc").unwrap().content().as_ref(), b"A256GCM");
    }

    #[test]
    fn unknown_key_leaves_token_encrypted() {
        let token = seal(&[1; 32], r#"{"alg":"dir","enc":"A256GCM"}"#, b"secret");
        let msg = converter().parse_message(token.into_bytes(), MessageMetadata::new());
        assert!(msg.root().has_facet(FacetKind::Jwe));
        assert!(msg.find_first("$.body").is_none());
        assert_eq!(msg.root().notes(), vec!["no matching key for JWE"]);
    }
}

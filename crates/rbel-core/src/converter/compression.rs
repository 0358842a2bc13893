//! gzip/deflate decompression.

use std::io::Read;

use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

use super::http::enclosing_http_message;
use super::{ConversionContext, Converter};
use crate::element::{Facet, FacetKind, NodeId};
use crate::error::ConversionError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Inflates HTTP bodies with a `Content-Encoding` and raw gzip data anywhere.
#[derive(Debug, Default)]
pub struct CompressionConverter;

fn inflate(encoding: &str, data: &[u8], limit: usize) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let limit = limit as u64 + 1;
    match encoding {
        "gzip" => GzDecoder::new(data).take(limit).read_to_end(&mut out)?,
        // zlib-wrapped first, raw deflate otherwise.
        _ => match ZlibDecoder::new(data).take(limit).read_to_end(&mut out) {
            Ok(n) => n,
            Err(_) => {
                out.clear();
                DeflateDecoder::new(data).take(limit).read_to_end(&mut out)?
            }
        },
    };
    Ok(out)
}

impl Converter for CompressionConverter {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["http"]
    }

    fn consider(
        &self,
        ctx: &mut ConversionContext<'_>,
        node: NodeId,
    ) -> Result<bool, ConversionError> {
        let message = ctx.message();
        let element = message.element(node);
        if element.has_facet(FacetKind::Compressed) || element.size() == 0 {
            return Ok(false);
        }
        let declared = enclosing_http_message(message, node)
            .and_then(|http| message.header_value(http, "Content-Encoding"))
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| v == "gzip" || v == "x-gzip" || v == "deflate");
        let encoding = match declared {
            Some(v) if v == "deflate" => "deflate",
            Some(_) => "gzip",
            None if element.content().starts_with(&GZIP_MAGIC) => "gzip",
            None => return Ok(false),
        };

        let content = ctx.content(node);
        let limit = ctx.config().max_message_size;
        let decoded = inflate(encoding, &content, limit)
            .map_err(|e| ConversionError::new(format!("{} decoding failed: {}", encoding, e)))?;
        if decoded.len() > limit {
            return Err(ConversionError::new(format!(
                "inflated content exceeds {} bytes",
                limit
            )));
        }

        let decoded = ctx.add_child(node, "decoded", Bytes::from(decoded));
        ctx.add_facet(node, Facet::Compressed {
            encoding: encoding.to_string(),
            decoded,
        });
        ctx.convert(decoded);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;

    use super::*;
    use crate::config::RbelConfig;
    use crate::converter::RbelConverter;
    use crate::element::MessageMetadata;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn inflates_gzip_http_body() {
        let body = gzip(br#"{"answer":42}"#);
        let mut raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(&body);

        let converter = RbelConverter::new(RbelConfig::default()).unwrap();
        let msg = converter.parse_message(raw, MessageMetadata::new());
        let answer = msg.find_first("$.body.decoded.answer").unwrap();
        assert_eq!(answer.content().as_ref(), b"42");
    }

    #[test]
    fn inflates_zlib_deflate_body() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"plain text").unwrap();
        let body = encoder.finish().unwrap();
        let mut raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: deflate\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(&body);

        let converter = RbelConverter::new(RbelConfig::default()).unwrap();
        let msg = converter.parse_message(raw, MessageMetadata::new());
        let decoded = msg.find_first("$.body.decoded").unwrap();
        assert_eq!(decoded.content().as_ref(), b"plain text");
    }

    #[test]
    fn recognises_raw_gzip_magic() {
        let converter = RbelConverter::new(RbelConfig::default()).unwrap();
        let msg = converter.parse_message(gzip(b"hello gzip"), MessageMetadata::new());
        match msg.root().facet(FacetKind::Compressed) {
            Some(Facet::Compressed { encoding, decoded }) => {
                assert_eq!(encoding, "gzip");
                assert_eq!(msg.element(*decoded).content().as_ref(), b"hello gzip");
            }
            other => panic!("unexpected facet {:?}", other),
        }
    }

    #[test]
    fn corrupt_gzip_becomes_note() {
        let converter = RbelConverter::new(RbelConfig::default()).unwrap();
        let corrupt = [0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0xff, 0xff, 0xff, 0xff];
        let msg = converter.parse_message(corrupt.to_vec(), MessageMetadata::new());
        assert!(!msg.root().has_facet(FacetKind::Compressed));
        assert!(msg.root().notes()[0].contains("compression"));
    }
}

//! Request-target converter: path plus percent-decoded query parameters.

use bytes::Bytes;

use super::{ConversionContext, Converter};
use crate::element::{Facet, FacetKind, NodeId};
use crate::error::ConversionError;

/// Decodes `%XX` escapes and `+` as space.
///
/// Malformed escapes are kept literally.
pub(crate) fn percent_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                        continue;
                    }
                    _ => out.push(b'%'),
                }
            }
            b'+' => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }
    out
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Splits `a=1&b=2` into decoded pairs. Empty segments are skipped.
pub(crate) fn parse_pairs(query: &str) -> Vec<(String, Vec<u8>)> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (
                String::from_utf8_lossy(&percent_decode(name)).into_owned(),
                percent_decode(value),
            )
        })
        .collect()
}

/// Parses the path of an HTTP request.
#[derive(Debug, Default)]
pub struct UriConverter;

impl Converter for UriConverter {
    fn name(&self) -> &'static str {
        "uri"
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
        if element.has_facet(FacetKind::Uri) {
            return Ok(false);
        }
        let is_request_path = element.parent().is_some_and(|parent| {
            matches!(
                message.element(parent).facet(FacetKind::HttpRequest),
                Some(Facet::HttpRequest { path, .. }) if *path == node
            )
        });
        if !is_request_path {
            return Ok(false);
        }
        let Some(target) = element.content_str().map(str::to_string) else {
            return Ok(false);
        };

        let (path, query) = target.split_once('?').unwrap_or((target.as_str(), ""));
        let path = String::from_utf8_lossy(&percent_decode(path)).into_owned();
        let mut parameters = Vec::new();
        for (name, value) in parse_pairs(query) {
            let child = ctx.add_child(node, &name, Bytes::from(value));
            parameters.push((name, child));
        }
        ctx.add_facet(node, Facet::Uri {
            path,
            parameters: parameters.clone(),
        });
        for (_, child) in parameters {
            ctx.convert(child);
        }
        Ok(true)
    }
}

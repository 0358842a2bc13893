//! `application/x-www-form-urlencoded` bodies.

use bytes::Bytes;

use super::http::enclosing_http_message;
use super::uri::parse_pairs;
use super::{ConversionContext, Converter};
use crate::element::{Facet, FacetKind, NodeId};
use crate::error::ConversionError;

/// Splits form bodies into decoded parameters.
#[derive(Debug, Default)]
pub struct FormConverter;

impl Converter for FormConverter {
    fn name(&self) -> &'static str {
        "form"
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
        if element.has_facet(FacetKind::Form) || element.size() == 0 {
            return Ok(false);
        }
        let is_form = enclosing_http_message(message, node)
            .and_then(|http| message.header_value(http, "Content-Type"))
            .is_some_and(|ct| {
                ct.to_ascii_lowercase()
                    .starts_with("application/x-www-form-urlencoded")
            });
        if !is_form {
            return Ok(false);
        }
        let Some(text) = element.content_str().map(str::to_string) else {
            return Err(ConversionError::new("form body is not valid UTF-8"));
        };

        let mut parameters = Vec::new();
        for (name, value) in parse_pairs(text.trim()) {
            let child = ctx.add_child(node, &name, Bytes::from(value));
            parameters.push((name, child));
        }
        ctx.add_facet(node, Facet::Form {
            parameters: parameters.clone(),
        });
        for (_, child) in parameters {
            ctx.convert(child);
        }
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
    fn parses_form_body() {
        let body = "grant_type=authorization_code&redirect_uri=https%3A%2F%2Fexample.org%2Fcb&scope=a+b";
        let raw = format!(
            "POST /token HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let converter = RbelConverter::new(RbelConfig::default()).unwrap();
        let msg = converter.parse_message(raw.into_bytes(), MessageMetadata::new());

        assert!(msg.find_first("$.body").unwrap().has_facet(FacetKind::Form));
        assert_eq!(
            msg.find_first("$.body.redirect_uri").unwrap().content().as_ref(),
            b"https://example.org/cb"
        );
        assert_eq!(
            msg.find_first("$.body.scope").unwrap().content().as_ref(),
            b"a b"
        );
    }

    #[test]
    fn ignores_bodies_without_form_content_type() {
        let raw = "POST /token HTTP/1.1\r\nContent-Length: 3\r\n\r\na=b";
        let converter = RbelConverter::new(RbelConfig::default()).unwrap();
        let msg = converter.parse_message(raw.as_bytes().to_vec(), MessageMetadata::new());
        assert!(!msg.find_first("$.body").unwrap().has_facet(FacetKind::Form));
    }
}

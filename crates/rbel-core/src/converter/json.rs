//! JSON objects and arrays.

use bytes::Bytes;
use serde_json::Value;

use super::{ConversionContext, Converter};
use crate::element::{Facet, FacetKind, JsonShape, NodeId};
use crate::error::ConversionError;

/// Splits JSON containers into one child per member.
///
/// String members carry their unescaped text, so JSON embedded in strings
/// is parsed one level down.
#[derive(Debug, Default)]
pub struct JsonConverter;

fn looks_like_json(content: &[u8]) -> bool {
    let trimmed = content.trim_ascii();
    matches!(
        (trimmed.first(), trimmed.last()),
        (Some(b'{'), Some(b'}')) | (Some(b'['), Some(b']'))
    )
}

fn member_content(value: &Value) -> Bytes {
    match value {
        Value::String(s) => Bytes::from(s.clone().into_bytes()),
        other => Bytes::from(other.to_string().into_bytes()),
    }
}

impl Converter for JsonConverter {
    fn name(&self) -> &'static str {
        "json"
    }

    fn consider(
        &self,
        ctx: &mut ConversionContext<'_>,
        node: NodeId,
    ) -> Result<bool, ConversionError> {
        let element = ctx.message().element(node);
        if element.has_facet(FacetKind::Json) || !looks_like_json(element.content()) {
            return Ok(false);
        }
        let Ok(value) = serde_json::from_slice::<Value>(element.content()) else {
            return Ok(false);
        };

        let (shape, members): (JsonShape, Vec<(String, Value)>) = match value {
            Value::Object(map) => (JsonShape::Object, map.into_iter().collect()),
            Value::Array(items) => (
                JsonShape::Array,
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| (i.to_string(), v))
                    .collect(),
            ),
            _ => return Ok(false),
        };

        let mut entries = Vec::with_capacity(members.len());
        let mut scalars = Vec::new();
        for (key, value) in members {
            let child = ctx.add_child(node, &key, member_content(&value));
            if !value.is_object() && !value.is_array() {
                scalars.push((child, value));
            }
            entries.push((key, child));
        }
        ctx.add_facet(node, Facet::Json {
            shape,
            entries: entries.clone(),
        });
        for (child, value) in scalars {
            ctx.add_facet(child, Facet::Value(value));
        }
        for (_, child) in entries {
            ctx.convert(child);
        }
        Ok(true)
    }
}

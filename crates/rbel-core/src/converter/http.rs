//! HTTP/1.x request and response converter.
//!
//! Also exposes [`frame_http`], which the capture layer uses to decide how
//! many buffered bytes form one complete message.

use std::ops::Range;

use bytes::Bytes;

use super::{ConversionContext, Converter};
use crate::element::{Facet, FacetKind, NodeId, NoteSeverity, RbelMessage};
use crate::error::ConversionError;

const METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE", "CONNECT",
];

/// Result of looking for a complete HTTP message at the start of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// A complete message of this many bytes.
    Complete(usize),
    /// Looks like HTTP but more bytes are needed.
    Incomplete,
    /// Not HTTP.
    NotHttp,
}

/// Determines whether `buf` starts with a complete HTTP message.
///
/// Responses without a length are complete at the end of the buffer, since
/// they run until the connection closes.
pub fn frame_http(buf: &[u8]) -> Framing {
    if !starts_like_http(buf) {
        return Framing::NotHttp;
    }
    let head = match parse_head(buf) {
        Scan::Found(head) => head,
        Scan::NeedMore if buf.len() > MAX_HEAD => return Framing::NotHttp,
        Scan::NeedMore => return Framing::Incomplete,
        // The blank line still delimits the broken head.
        Scan::Invalid => {
            return find(buf, b"\r\n\r\n", 0).map_or(Framing::NotHttp, |blank| {
                Framing::Complete(blank + 4)
            })
        }
    };
    let rest = &buf[head.header_end..];
    match body_framing(buf, &head) {
        BodyFraming::Empty => Framing::Complete(head.header_end),
        BodyFraming::Length(n) if rest.len() >= n => Framing::Complete(head.header_end + n),
        BodyFraming::Length(_) => Framing::Incomplete,
        BodyFraming::Chunked => match dechunk(rest) {
            Scan::Found((_, consumed)) => Framing::Complete(head.header_end + consumed),
            Scan::NeedMore => Framing::Incomplete,
            Scan::Invalid => Framing::Complete(buf.len()),
        },
        BodyFraming::ToEnd => Framing::Complete(buf.len()),
    }
}

/// Longest head or chunk-size line waited for before giving up.
const MAX_HEAD: usize = 64 * 1024;

/// Outcome of scanning a buffer that may still be growing.
#[derive(Debug, PartialEq, Eq)]
enum Scan<T> {
    Found(T),
    /// Well-formed so far, more bytes are needed.
    NeedMore,
    /// No amount of further bytes can make this valid.
    Invalid,
}

#[derive(Debug)]
enum StartLine<'a> {
    Request {
        method: &'a str,
        target: Range<usize>,
        version: &'a str,
    },
    Response {
        version: &'a str,
        code: u16,
        code_range: Range<usize>,
        reason: &'a str,
    },
}

#[derive(Debug)]
struct Head<'a> {
    start: StartLine<'a>,
    /// Header lines, without the start line and the blank line.
    block: Range<usize>,
    /// Name and value range of each header, in order.
    headers: Vec<(&'a str, Range<usize>)>,
    /// Offset of the first body byte.
    header_end: usize,
}

impl Head<'_> {
    fn header(&self, buf: &[u8], name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, r)| String::from_utf8_lossy(&buf[r.clone()]).into_owned())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum BodyFraming {
    Empty,
    Length(usize),
    Chunked,
    ToEnd,
}

fn starts_like_http(buf: &[u8]) -> bool {
    buf.starts_with(b"HTTP/")
        || METHODS.iter().any(|m| {
            buf.len() > m.len() && buf.starts_with(m.as_bytes()) && buf[m.len()] == b' '
        })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn parse_head(buf: &[u8]) -> Scan<Head<'_>> {
    let Some(blank) = find(buf, b"\r\n\r\n", 0) else {
        return Scan::NeedMore;
    };
    match parse_complete_head(buf, blank) {
        Some(head) => Scan::Found(head),
        None => Scan::Invalid,
    }
}

/// Parses a head whose blank line starts at `blank`.
fn parse_complete_head(buf: &[u8], blank: usize) -> Option<Head<'_>> {
    let line_end = find(buf, b"\r\n", 0)?;
    let start_line = std::str::from_utf8(&buf[..line_end]).ok()?;
    let start = parse_start_line(start_line)?;

    let block_start = (line_end + 2).min(blank);
    let mut headers = Vec::new();
    let mut pos = block_start;
    while pos < blank {
        let end = find(buf, b"\r\n", pos).unwrap_or(blank).min(blank);
        let line = &buf[pos..end];
        let colon = line.iter().position(|b| *b == b':')?;
        let name = std::str::from_utf8(&line[..colon]).ok()?.trim();
        if name.is_empty() {
            return None;
        }
        let mut value_start = pos + colon + 1;
        let mut value_end = end;
        while value_start < value_end && buf[value_start].is_ascii_whitespace() {
            value_start += 1;
        }
        while value_end > value_start && buf[value_end - 1].is_ascii_whitespace() {
            value_end -= 1;
        }
        headers.push((name, value_start..value_end));
        pos = end + 2;
    }

    Some(Head {
        start,
        block: block_start..blank,
        headers,
        header_end: blank + 4,
    })
}

fn parse_start_line(line: &str) -> Option<StartLine<'_>> {
    if line.starts_with("HTTP/") {
        let mut parts = line.splitn(3, ' ');
        let version = parts.next()?;
        let code_str = parts.next()?;
        let code: u16 = code_str.parse().ok()?;
        let code_start = version.len() + 1;
        return Some(StartLine::Response {
            version,
            code,
            code_range: code_start..code_start + code_str.len(),
            reason: parts.next().unwrap_or(""),
        });
    }
    let mut parts = line.split(' ');
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if parts.next().is_some() || !METHODS.contains(&method) || !version.starts_with("HTTP/") {
        return None;
    }
    let target_start = method.len() + 1;
    Some(StartLine::Request {
        method,
        target: target_start..target_start + target.len(),
        version,
    })
}

fn body_framing(buf: &[u8], head: &Head<'_>) -> BodyFraming {
    if head
        .header(buf, "Transfer-Encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        return BodyFraming::Chunked;
    }
    if let Some(length) = head
        .header(buf, "Content-Length")
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        return if length == 0 {
            BodyFraming::Empty
        } else {
            BodyFraming::Length(length)
        };
    }
    match head.start {
        StartLine::Request { .. } => BodyFraming::Empty,
        StartLine::Response { code, .. } if code < 200 || code == 204 || code == 304 => {
            BodyFraming::Empty
        }
        StartLine::Response { .. } => BodyFraming::ToEnd,
    }
}

/// Decodes a chunked body into the payload and the number of raw bytes
/// consumed.
fn dechunk(buf: &[u8]) -> Scan<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        let Some(line_end) = find(buf, b"\r\n", pos) else {
            return if buf.len() - pos > MAX_HEAD {
                Scan::Invalid
            } else {
                Scan::NeedMore
            };
        };
        let Some(size) = chunk_size(&buf[pos..line_end]) else {
            return Scan::Invalid;
        };
        pos = line_end + 2;
        if size == 0 {
            // Optional trailers, terminated by an empty line.
            loop {
                let Some(end) = find(buf, b"\r\n", pos) else {
                    return Scan::NeedMore;
                };
                let empty = end == pos;
                pos = end + 2;
                if empty {
                    return Scan::Found((out, pos));
                }
            }
        }
        let Some(chunk_end) = pos.checked_add(size).and_then(|end| end.checked_add(2)) else {
            return Scan::Invalid;
        };
        if buf.len() < chunk_end {
            return Scan::NeedMore;
        }
        if &buf[chunk_end - 2..chunk_end] != b"\r\n" {
            return Scan::Invalid;
        }
        out.extend_from_slice(&buf[pos..chunk_end - 2]);
        pos = chunk_end;
    }
}

fn chunk_size(line: &[u8]) -> Option<usize> {
    let line = std::str::from_utf8(line).ok()?;
    let size = line.split(';').next()?.trim();
    usize::from_str_radix(size, 16).ok()
}

/// The HTTP message whose body is `node`, if any.
pub(crate) fn enclosing_http_message(message: &RbelMessage, node: NodeId) -> Option<NodeId> {
    let parent = message.element(node).parent()?;
    match message.element(parent).facet(FacetKind::HttpMessage) {
        Some(Facet::HttpMessage { body, .. }) if *body == node => Some(parent),
        _ => None,
    }
}

/// Parses HTTP/1.x messages.
#[derive(Debug, Default)]
pub struct HttpConverter;

impl Converter for HttpConverter {
    fn name(&self) -> &'static str {
        "http"
    }

    fn consider(
        &self,
        ctx: &mut ConversionContext<'_>,
        node: NodeId,
    ) -> Result<bool, ConversionError> {
        if ctx.message().element(node).has_facet(FacetKind::HttpMessage) {
            return Ok(false);
        }
        let content = ctx.content(node);
        if !starts_like_http(&content) {
            return Ok(false);
        }
        let Scan::Found(head) = parse_head(&content) else {
            return Ok(false);
        };

        let rest = content.slice(head.header_end..);
        let mut truncation = None;
        let body = match body_framing(&content, &head) {
            BodyFraming::Empty => Bytes::new(),
            BodyFraming::Length(n) if rest.len() >= n => rest.slice(..n),
            BodyFraming::Length(n) => {
                truncation = Some(format!(
                    "body truncated: expected {} bytes, got {}",
                    n,
                    rest.len()
                ));
                rest
            }
            BodyFraming::Chunked => match dechunk(&rest) {
                Scan::Found((decoded, _)) => Bytes::from(decoded),
                Scan::NeedMore => {
                    truncation = Some("chunked body is incomplete".to_string());
                    rest
                }
                Scan::Invalid => {
                    truncation = Some("chunked body is malformed".to_string());
                    rest
                }
            },
            BodyFraming::ToEnd => rest,
        };

        let header = ctx.add_child(node, "header", content.slice(head.block.clone()));
        let mut entries = Vec::with_capacity(head.headers.len());
        for (name, range) in &head.headers {
            let value = ctx.add_child(header, name, content.slice(range.clone()));
            entries.push((name.to_string(), value));
        }
        let body = ctx.add_child(node, "body", body);

        ctx.add_facet(node, Facet::HttpMessage { header, body });
        ctx.add_facet(header, Facet::HttpHeaders {
            entries: entries.clone(),
        });

        let mut path = None;
        match &head.start {
            StartLine::Request {
                method,
                target,
                version,
            } => {
                let method = ctx.add_child(node, "method", Bytes::copy_from_slice(method.as_bytes()));
                let target = ctx.add_child(node, "path", content.slice(target.clone()));
                ctx.add_facet(node, Facet::HttpRequest {
                    method,
                    path: target,
                    version: version.to_string(),
                });
                path = Some(target);
            }
            StartLine::Response {
                version,
                code,
                code_range,
                reason,
            } => {
                let status = ctx.add_child(node, "responseCode", content.slice(code_range.clone()));
                ctx.add_facet(status, Facet::Value(serde_json::Value::from(*code)));
                ctx.add_facet(node, Facet::HttpResponse {
                    status,
                    status_code: *code,
                    reason: reason.to_string(),
                    version: version.to_string(),
                });
            }
        }
        if let Some(text) = truncation {
            tracing::debug!("{}", text);
            ctx.add_note(node, NoteSeverity::Warn, text);
        }

        for (_, value) in entries {
            ctx.convert(value);
        }
        if let Some(path) = path {
            ctx.convert(path);
        }
        ctx.convert(body);
        Ok(true)
    }
}

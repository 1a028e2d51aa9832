//! W3C trace-context propagation.
//!
//! The gateway does not export spans itself (the OTLP exporter is an external
//! collaborator); it only guarantees that every request leaving for an
//! upstream carries a valid `traceparent`, continuing the inbound trace when
//! one is present.

use rand::Rng;

/// Header name for W3C trace propagation.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Parsed `traceparent` fields: `(trace_id, parent_id, flags)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceParent {
    pub trace_id: String,
    pub parent_id: String,
    pub flags: String,
}

impl TraceParent {
    /// Render back to the wire form.
    pub fn header_value(&self) -> String {
        format!("00-{}-{}-{}", self.trace_id, self.parent_id, self.flags)
    }
}

/// Parse a `traceparent` header value (version 00 only).
pub fn parse(value: &str) -> Option<TraceParent> {
    let mut parts = value.trim().split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let parent_id = parts.next()?;
    let flags = parts.next()?;
    if parts.next().is_some() || version != "00" {
        return None;
    }
    if !is_hex(trace_id, 32) || trace_id.bytes().all(|b| b == b'0') {
        return None;
    }
    if !is_hex(parent_id, 16) || parent_id.bytes().all(|b| b == b'0') {
        return None;
    }
    if !is_hex(flags, 2) {
        return None;
    }
    Some(TraceParent {
        trace_id: trace_id.to_string(),
        parent_id: parent_id.to_string(),
        flags: flags.to_string(),
    })
}

/// Produce the `traceparent` to send upstream: continue the inbound trace
/// with a fresh span id, or start a new sampled trace.
pub fn child_of(inbound: Option<&str>) -> String {
    match inbound.and_then(parse) {
        Some(parent) => TraceParent {
            trace_id: parent.trace_id,
            parent_id: new_span_id(),
            flags: parent.flags,
        }
        .header_value(),
        None => TraceParent {
            trace_id: new_trace_id(),
            parent_id: new_span_id(),
            flags: "01".to_string(),
        }
        .header_value(),
    }
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

fn new_trace_id() -> String {
    // W3C trace-context treats all-zero ids as invalid; force the low bit.
    let id: u128 = rand::thread_rng().gen::<u128>() | 1;
    format!("{id:032x}")
}

fn new_span_id() -> String {
    let id: u64 = rand::thread_rng().gen::<u64>() | 1;
    format!("{id:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_traceparent() {
        let tp = parse("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01").unwrap();
        assert_eq!(tp.trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(tp.parent_id, "b7ad6b7169203331");
        assert_eq!(tp.flags, "01");
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(parse("").is_none());
        assert!(parse("01-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01").is_none());
        assert!(parse("00-short-b7ad6b7169203331-01").is_none());
        assert!(parse("00-00000000000000000000000000000000-b7ad6b7169203331-01").is_none());
        assert!(parse("00-0af7651916cd43dd8448eb211c80319c-0000000000000000-01").is_none());
        assert!(parse("00-0AF7651916CD43DD8448EB211C80319C-b7ad6b7169203331-01").is_none());
    }

    #[test]
    fn child_keeps_trace_id_and_rotates_span() {
        let inbound = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";
        let child = child_of(Some(inbound));
        let tp = parse(&child).unwrap();
        assert_eq!(tp.trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert_ne!(tp.parent_id, "b7ad6b7169203331");
    }

    #[test]
    fn child_of_nothing_starts_a_trace() {
        let child = child_of(None);
        let tp = parse(&child).unwrap();
        assert_eq!(tp.flags, "01");
        let other = child_of(None);
        assert_ne!(child, other);
    }
}

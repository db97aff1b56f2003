//! W3C Trace Context (`traceparent`) and `baggage` header propagation.
//!
//! ```text
//! traceparent: 00-<32 hex trace id>-<16 hex span id>-<2 hex flags>
//! baggage:     tenant=acme,region=eu,filter=a%3D1%2Cb%3D2
//! ```
//!
//! Baggage keys and values are percent-encoded, so delimiters and surrounding
//! whitespace survive the trip.

use crate::context::{Baggage, TraceContext};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use std::collections::HashMap;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const BAGGAGE_HEADER: &str = "baggage";

const SUPPORTED_VERSION: u8 = 0;
const FLAG_SAMPLED: u8 = 0x01;

/// Everything except unreserved URI characters is escaped.
const BAGGAGE_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Write side of a header carrier.
pub trait Injector {
    fn set(&mut self, key: &str, value: String);
}

/// Read side of a header carrier. Lookups are case-insensitive.
pub trait Extractor {
    fn get(&self, key: &str) -> Option<&str>;
}

impl Injector for HashMap<String, String> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_ascii_lowercase(), value);
    }
}

impl Extractor for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        if let Some(value) = HashMap::get(self, key) {
            return Some(value.as_str());
        }
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Writes `cx` into the carrier. Baggage is only written when non-empty.
pub fn inject(cx: &TraceContext, carrier: &mut dyn Injector) {
    let flags = if cx.sampled { FLAG_SAMPLED } else { 0 };
    carrier.set(
        TRACEPARENT_HEADER,
        format!(
            "{SUPPORTED_VERSION:02x}-{}-{}-{flags:02x}",
            cx.trace_id_hex(),
            cx.span_id_hex()
        ),
    );
    if !cx.baggage.is_empty() {
        carrier.set(BAGGAGE_HEADER, format_baggage(&cx.baggage));
    }
}

/// Injects the active context, if any.
pub fn inject_current(carrier: &mut dyn Injector) {
    if let Some(cx) = crate::context::current() {
        inject(&cx, carrier);
    }
}

/// Reads a remote parent from the carrier.
///
/// The returned context carries the remote span id; start a span with it as
/// parent (`SpanBuilder::with_parent`) to continue the trace. Malformed
/// headers yield `None`.
pub fn extract(carrier: &dyn Extractor) -> Option<TraceContext> {
    let header = carrier.get(TRACEPARENT_HEADER)?;
    let (trace_id, span_id, flags) = parse_traceparent(header)?;
    let baggage = carrier
        .get(BAGGAGE_HEADER)
        .map(parse_baggage)
        .unwrap_or_default();
    Some(TraceContext {
        trace_id,
        span_id,
        parent_span_id: None,
        sampled: flags & FLAG_SAMPLED != 0,
        baggage,
    })
}

fn parse_traceparent(header: &str) -> Option<(u128, u64, u8)> {
    let mut parts = header.trim().split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let span_id = parts.next()?;
    let flags = parts.next()?;

    if version.len() != 2 || trace_id.len() != 32 || span_id.len() != 16 || flags.len() != 2 {
        return None;
    }
    let version = u8::from_str_radix(version, 16).ok()?;
    // 0xff is forbidden; version 00 has exactly four fields.
    if version == 0xff || (version == SUPPORTED_VERSION && parts.next().is_some()) {
        return None;
    }
    let is_lower_hex = |s: &str| s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !is_lower_hex(trace_id) || !is_lower_hex(span_id) {
        return None;
    }
    let trace_id = u128::from_str_radix(trace_id, 16).ok()?;
    let span_id = u64::from_str_radix(span_id, 16).ok()?;
    let flags = u8::from_str_radix(flags, 16).ok()?;
    if trace_id == 0 || span_id == 0 {
        return None;
    }
    Some((trace_id, span_id, flags))
}

fn format_baggage(baggage: &Baggage) -> String {
    baggage
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, BAGGAGE_ESCAPE),
                utf8_percent_encode(v, BAGGAGE_ESCAPE)
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_baggage(header: &str) -> Baggage {
    header
        .split(',')
        .filter_map(|member| {
            // Member properties (`;prop`) are not propagated.
            let pair = member.split(';').next()?;
            let (key, value) = pair.split_once('=')?;
            let key = percent_decode_str(key.trim()).decode_utf8().ok()?;
            let value = percent_decode_str(value.trim()).decode_utf8().ok()?;
            (!key.is_empty()).then(|| (key.into_owned(), value.into_owned()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_then_extract() {
        let cx = TraceContext::new_root(true).with_baggage("tenant", "acme");
        let mut headers: HashMap<String, String> = HashMap::new();
        inject(&cx, &mut headers);

        assert_eq!(
            headers[TRACEPARENT_HEADER],
            format!("00-{}-{}-01", cx.trace_id_hex(), cx.span_id_hex())
        );
        let remote = extract(&headers).unwrap();
        assert_eq!(remote.trace_id, cx.trace_id);
        assert_eq!(remote.span_id, cx.span_id);
        assert!(remote.sampled);
        assert_eq!(remote.baggage.get("tenant").map(String::as_str), Some("acme"));
    }

    #[test]
    fn test_extract_is_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert(
            "Traceparent".to_string(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00".to_string(),
        );
        let cx = extract(&headers).unwrap();
        assert_eq!(cx.trace_id_hex(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(cx.span_id_hex(), "00f067aa0ba902b7");
        assert!(!cx.sampled);
        assert!(cx.baggage.is_empty());
    }

    #[test]
    fn test_malformed_traceparent_rejected() {
        for bad in [
            "",
            "00-abc-00f067aa0ba902b7-01",
            "ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01",
            "00-4BF92F3577B34DA6A3CE929D0E0E4736-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra",
        ] {
            let mut headers = HashMap::new();
            headers.insert(TRACEPARENT_HEADER.to_string(), bad.to_string());
            assert!(extract(&headers).is_none(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_baggage_parsing_skips_properties_and_junk() {
        let baggage = parse_baggage("a=1, b = 2 ;prop=x,=nokey,novalue");
        assert_eq!(baggage.len(), 2);
        assert_eq!(baggage["a"], "1");
        assert_eq!(baggage["b"], "2");
    }

    #[test]
    fn test_baggage_delimiters_survive_round_trip() {
        let cx = TraceContext::new_root(true)
            .with_baggage("filter", "a=1,b=2")
            .with_baggage("note", " padded ")
            .with_baggage("user id", "ünïcode;x");
        let mut headers: HashMap<String, String> = HashMap::new();
        inject(&cx, &mut headers);

        let header = &headers[BAGGAGE_HEADER];
        assert!(!header.contains(' '));
        assert_eq!(header.matches(',').count(), 2);

        let remote = extract(&headers).unwrap();
        assert_eq!(remote.baggage, cx.baggage);
        assert_eq!(remote.baggage["filter"], "a=1,b=2");
        assert_eq!(remote.baggage["note"], " padded ");
    }

    #[test]
    fn test_baggage_with_invalid_escape_is_skipped() {
        let baggage = parse_baggage("ok=%41,bad=%FF%FE");
        assert_eq!(baggage.len(), 1);
        assert_eq!(baggage["ok"], "A");
    }

    #[test]
    fn test_inject_current_without_context_is_noop() {
        let mut headers: HashMap<String, String> = HashMap::new();
        inject_current(&mut headers);
        assert!(headers.is_empty());
    }
}

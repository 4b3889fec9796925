//! W3C `traceparent` header parsing and formatting.
//!
//! The source accepts exactly one shape: `00-<32 hex>-<16 hex>-01` — version
//! byte fixed at `00`, trace flags fixed at `01` (sampled). Anything else is
//! rejected outright rather than partially parsed. This is narrower than the
//! full W3C Trace Context grammar (which allows other version/flag bytes);
//! we match the source's strictness rather than the full spec, since this
//! crate only ever emits the one shape it accepts.

/// Parse a `traceparent` header value.
///
/// Returns `(trace_id, parent_id)` on an exact match of
/// `00-<32 lowercase/uppercase hex>-<16 lowercase/uppercase hex>-01`, or
/// `(None, None)` on any deviation — wrong part count, wrong lengths,
/// non-hex characters, wrong version, or wrong flags byte. Hex digits are
/// matched case-insensitively but the returned ids are not case-normalized
/// (callers get back exactly the substring that was in the header). A
/// rejection is logged as an [`crate::error::AgentError::ParseFailed`]
/// before the offending value is discarded.
pub fn parse(traceparent: &str) -> (Option<String>, Option<String>) {
    match try_parse(traceparent) {
        Some((trace_id, parent_id)) => (Some(trace_id), Some(parent_id)),
        None => {
            let err = crate::error::AgentError::ParseFailed(format!(
                "malformed traceparent header: {traceparent:?}"
            ));
            tracing::warn!(error = %err, "{err}");
            (None, None)
        }
    }
}

fn try_parse(traceparent: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = traceparent.split('-').collect();
    if parts.len() != 4 {
        return None;
    }
    let (version, trace_id, parent_id, flags) = (parts[0], parts[1], parts[2], parts[3]);

    if version != "00" {
        return None;
    }
    if flags != "01" {
        return None;
    }
    if trace_id.len() != 32 || !is_hex(trace_id) {
        return None;
    }
    if parent_id.len() != 16 || !is_hex(parent_id) {
        return None;
    }

    Some((trace_id.to_string(), parent_id.to_string()))
}

/// Format a `traceparent` header value from a 32-hex trace id and a 16-hex
/// parent id. Does not validate its inputs: callers are expected to pass
/// ids produced by [`crate::ids`], which already satisfy the width/charset
/// invariants.
pub fn format(trace_id: &str, parent_id: &str) -> String {
    format!("00-{trace_id}-{parent_id}-01")
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_traceparent() {
        let (trace, parent) = parse(
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        );
        assert_eq!(trace.as_deref(), Some("0af7651916cd43dd8448eb211c80319c"));
        assert_eq!(parent.as_deref(), Some("b7ad6b7169203331"));
    }

    #[test]
    fn parses_case_insensitive_hex() {
        let (trace, parent) = parse(
            "00-0AF7651916CD43DD8448EB211C80319C-B7AD6B7169203331-01",
        );
        assert!(trace.is_some());
        assert!(parent.is_some());
    }

    #[test]
    fn rejects_wrong_part_count() {
        assert_eq!(parse("00-aaaa-bbbb"), (None, None));
        assert_eq!(parse(""), (None, None));
    }

    #[test]
    fn rejects_wrong_version() {
        let s = "99-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";
        assert_eq!(parse(s), (None, None));
    }

    #[test]
    fn rejects_unsampled_flags() {
        let s = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-00";
        assert_eq!(parse(s), (None, None));
    }

    #[test]
    fn rejects_wrong_width_ids() {
        let s = "00-aaaa-b7ad6b7169203331-01";
        assert_eq!(parse(s), (None, None));
        let s = "00-0af7651916cd43dd8448eb211c80319c-bbbb-01";
        assert_eq!(parse(s), (None, None));
    }

    #[test]
    fn rejects_non_hex() {
        let s = "00-zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz-b7ad6b7169203331-01";
        assert_eq!(parse(s), (None, None));
    }

    #[test]
    fn format_round_trips_through_parse() {
        let trace = "0af7651916cd43dd8448eb211c80319c";
        let parent = "b7ad6b7169203331";
        let header = format(trace, parent);
        assert_eq!(parse(&header), (Some(trace.to_string()), Some(parent.to_string())));
    }
}

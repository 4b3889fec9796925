//! Property-based check of the `traceparent` round-trip
//! (`parse(format(T, P)) == Some((T, P))` for all valid hex ids).

use proptest::prelude::*;
use terra_apm_agent::traceparent;

fn hex_string(len: usize) -> impl Strategy<Value = String> {
    proptest::collection::vec(0u8..16u8, len).prop_map(|digits| {
        digits
            .into_iter()
            .map(|d| std::char::from_digit(d as u32, 16).unwrap())
            .collect()
    })
}

proptest! {
    #[test]
    fn round_trips_for_any_valid_width_hex_ids(
        trace_id in hex_string(32),
        parent_id in hex_string(16),
    ) {
        let header = traceparent::format(&trace_id, &parent_id);
        let (parsed_trace, parsed_parent) = traceparent::parse(&header);
        prop_assert_eq!(parsed_trace, Some(trace_id));
        prop_assert_eq!(parsed_parent, Some(parent_id));
    }

    #[test]
    fn rejects_any_string_of_the_wrong_shape(garbage in "\\PC*") {
        let parts: Vec<&str> = garbage.split('-').collect();
        let looks_valid = parts.len() == 4
            && parts[0] == "00"
            && parts[3] == "01"
            && parts[1].len() == 32
            && parts[1].chars().all(|c| c.is_ascii_hexdigit())
            && parts[2].len() == 16
            && parts[2].chars().all(|c| c.is_ascii_hexdigit());
        if !looks_valid {
            prop_assert_eq!(traceparent::parse(&garbage), (None, None));
        }
    }
}

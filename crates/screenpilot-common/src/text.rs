/// Truncate a relayed payload to `max_chars`, appending an ellipsis marker
/// when anything was cut. Splits on a char boundary, never mid-codepoint.
pub fn truncate_payload(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("…");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_payload_unchanged() {
        assert_eq!(truncate_payload("hello", 10), "hello");
    }

    #[test]
    fn test_exact_length_unchanged() {
        assert_eq!(truncate_payload("hello", 5), "hello");
    }

    #[test]
    fn test_long_payload_truncated() {
        let out = truncate_payload("hello world", 5);
        assert_eq!(out, "hello…");
    }

    #[test]
    fn test_multibyte_boundary() {
        let out = truncate_payload("héllo wörld", 6);
        assert_eq!(out, "héllo …");
    }
}

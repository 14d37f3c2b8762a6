//! Topic pattern matching
//!
//! Binding keys and routing keys are dot-delimited words. In a binding key
//! `*` matches exactly one word and `#` matches zero or more words. Matching
//! is purely structural; empty words (`a..b`) are ordinary words.

/// Returns `true` if `routing_key` matches the topic binding `pattern`.
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // collapse runs of '#'
            if rest.first() == Some(&"#") {
                return match_words(rest, key);
            }
            (0..=key.len()).any(|skip| match_words(rest, &key[skip..]))
        }
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

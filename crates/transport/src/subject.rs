//! Subject validation and wildcard matching.

/// Prefix used for generated reply inboxes.
pub const INBOX_PREFIX: &str = "_INBOX";

/// Returns a fresh, collision-resistant inbox subject.
#[must_use]
pub fn new_inbox() -> String {
    format!("{INBOX_PREFIX}.{}", uuid::Uuid::new_v4().simple())
}

/// Whether `subject` is valid for publishing: non-empty tokens, no
/// whitespace, no wildcards.
#[must_use]
pub fn is_valid_publish_subject(subject: &str) -> bool {
    is_valid_subject(subject) && subject.split('.').all(|token| token != "*" && token != ">")
}

/// Whether `subject` is a valid subscription filter. `*` may stand for any
/// token and `>` may only appear as the last token.
#[must_use]
pub fn is_valid_subject(subject: &str) -> bool {
    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return false;
    }

    let tokens: Vec<&str> = subject.split('.').collect();
    let last = tokens.len() - 1;
    tokens.iter().enumerate().all(|(i, token)| {
        !token.is_empty()
            && ((*token == ">" && i == last)
                || (!token.contains('>') && (*token == "*" || !token.contains('*'))))
    })
}

/// Whether the literal `subject` is matched by `filter`.
#[must_use]
pub fn matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matching() {
        assert!(matches("foo.bar", "foo.bar"));
        assert!(matches("foo.*", "foo.bar"));
        assert!(matches("foo.>", "foo.bar.baz"));
        assert!(matches("*.bar.>", "foo.bar.baz.qux"));
        assert!(matches(">", "anything.at.all"));

        assert!(!matches("foo.*", "foo.bar.baz"));
        assert!(!matches("foo.>", "foo"));
        assert!(!matches("foo.bar", "foo"));
        assert!(!matches("foo", "foo.bar"));
    }

    #[test]
    fn test_subject_validation() {
        assert!(is_valid_subject("foo.*.>"));
        assert!(is_valid_publish_subject("foo.bar"));

        assert!(!is_valid_subject(""));
        assert!(!is_valid_subject("foo..bar"));
        assert!(!is_valid_subject("foo bar"));
        assert!(!is_valid_subject("foo.>.bar"));
        assert!(!is_valid_subject("foo.b*r"));
        assert!(!is_valid_publish_subject("foo.*"));
    }

    #[test]
    fn test_inboxes_are_unique() {
        let a = new_inbox();
        let b = new_inbox();
        assert!(a.starts_with("_INBOX."));
        assert_ne!(a, b);
    }
}

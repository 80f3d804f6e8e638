use serde::{Serialize, Serializer};
use std::fmt;

pub const REDACTED: &str = "[REDACTED]";

/// Wraps a sensitive value so that every log sink prints `[REDACTED]`.
///
/// Empty values print as an empty string, which keeps "was it set at all" visible
/// without leaking the value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Redacted<T>(pub T);

impl<T: AsRef<str>> Redacted<T> {
    fn rendered(&self) -> &'static str {
        if self.0.as_ref().is_empty() {
            ""
        } else {
            REDACTED
        }
    }

    #[must_use]
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: AsRef<str>> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rendered())
    }
}

impl<T: AsRef<str>> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rendered())
    }
}

impl<T: AsRef<str>> Serialize for Redacted<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.rendered())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_empty_is_redacted_everywhere() {
        let secret = Redacted("hunter2");
        assert_eq!(secret.to_string(), REDACTED);
        assert_eq!(format!("{secret:?}"), REDACTED);
        assert_eq!(
            serde_json::to_string(&secret).ok().as_deref(),
            Some("\"[REDACTED]\"")
        );
    }

    #[test]
    fn empty_stays_empty() {
        let secret = Redacted(String::new());
        assert_eq!(secret.to_string(), "");
        assert_eq!(serde_json::to_string(&secret).ok().as_deref(), Some("\"\""));
    }
}

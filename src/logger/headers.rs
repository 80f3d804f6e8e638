use super::redact::REDACTED;
use http::HeaderMap;
use std::fmt;

const SENSITIVE: [&str; 4] = ["authorization", "cookie", "x-csrf-token", "x-forwarded-for"];

#[must_use]
pub fn is_sensitive(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    SENSITIVE.contains(&name.as_str()) || name.contains("token") || name.contains("key")
}

/// Sorted, redacted, one-header-per-line rendering of a header map.
pub struct HeaderBlock<'a>(pub &'a HeaderMap);

impl fmt::Display for HeaderBlock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines: Vec<(&str, String)> = self
            .0
            .iter()
            .map(|(name, value)| {
                let value = if is_sensitive(name.as_str()) {
                    if value.is_empty() {
                        String::new()
                    } else {
                        REDACTED.to_string()
                    }
                } else {
                    String::from_utf8_lossy(value.as_bytes()).into_owned()
                };
                (name.as_str(), value)
            })
            .collect();
        lines.sort();

        for (index, (name, value)) in lines.iter().enumerate() {
            if index > 0 {
                f.write_str("\n")?;
            }
            write!(f, "    {name}: {value}")?;
        }
        Ok(())
    }
}

use chrono::{DateTime, Utc};

/// Lowercase slug safe for storage paths: every run of non-alphanumeric
/// characters becomes a single hyphen, with no leading or trailing hyphen.
pub fn sanitize_filename(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("unnamed");
    }
    slug
}

/// `YYYY-MM-DD_HH-MM-SS` in UTC.
pub fn timestamp_slug(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d_%H-%M-%S").to_string()
}

//! Target key canonicalization.
//!
//! Duplicate detection compares canonical keys, so every spelling of the
//! same target must reduce to one string. Rules, applied in order: trim,
//! lowercase, strip an http(s) scheme, strip a leading `www.`, strip
//! trailing slashes, collapse channel-style alias paths (`@handle`,
//! `c/<name>`, `channel/<id>`, `user/<name>`) to host plus that segment,
//! and drop any query or fragment. Keys that match none of the alias
//! forms pass through cleaned but otherwise untouched.

use std::sync::LazyLock;

use regex::Regex;

static ALIAS_FORM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<host>[^/?#]+)/(?P<form>@[^/?#]+|c/[^/?#]+|channel/[^/?#]+|user/[^/?#]+)")
        .unwrap()
});

/// Reduce a raw target key to its canonical form.
pub fn canonical_target_key(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let mut key = lowered.as_str();

    key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    key = key.strip_prefix("www.").unwrap_or(key);
    key = key.trim_end_matches('/');

    // Alias forms keep their marker: `host/@x` and `host/c/x` are
    // different channels even when `x` matches.
    if let Some(caps) = ALIAS_FORM.captures(key) {
        return format!("{}/{}", &caps["host"], &caps["form"]);
    }

    match key.split_once(['?', '#']) {
        Some((before, _)) => before.trim_end_matches('/').to_string(),
        None => key.to_string(),
    }
}

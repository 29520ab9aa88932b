//! Routable key derivation from a request path.
//!
//! ```text
//! /v/1/users/id/groups   → "groups"
//! /users/id              → "users"
//! /_billing/invoices     → "billing/invoices"
//! ```

/// Strip a leading `/v/<digits>` version marker, if any.
fn strip_version(path: &str) -> &str {
    let Some(rest) = path.strip_prefix("/v/") else {
        return path;
    };

    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return path;
    }

    &rest[digits..]
}

/// Derive the key under which the route table indexes the endpoints
/// serving `path`.
///
/// A first segment starting with `_` names a namespace prefix; the key is
/// then `"<prefix>/<identity>"`. The identity is the first segment for
/// `/parent` and `/parent/id` shapes, and the third for nested
/// `/parent/id/child` shapes.
pub fn target_identity(path: &str) -> String {
    let trimmed = strip_version(path);
    let trimmed = trimmed.strip_prefix('/').unwrap_or(trimmed);

    let mut parts: Vec<&str> = trimmed.split('/').collect();

    let prefix = match parts.first() {
        Some(first) if first.starts_with('_') => {
            let prefix = &first[1..];
            parts.remove(0);
            Some(prefix)
        }
        _ => None,
    };

    let identity = match parts.len() {
        0 => "",
        1 | 2 => parts[0],
        _ => parts[2],
    };

    match prefix {
        Some(prefix) => route_key(Some(prefix), identity),
        None => identity.to_string(),
    }
}

/// Build a route table key, namespaced when `prefix` is set.
pub fn route_key(prefix: Option<&str>, identity: &str) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix, identity),
        _ => identity.to_string(),
    }
}

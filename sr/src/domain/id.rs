//! Identifier and secret generation
//!
//! Destination IDs use the format `{6-char-hex}-{type}-{slug}`, e.g.
//! `a3f9c1-dest-kitchen-glasses`. Secrets are lowercase hex from the thread RNG.

use std::fmt::Write;

/// Generate a domain ID from type and title
pub fn generate_id(domain_type: &str, title: &str) -> String {
    let uuid = uuid::Uuid::now_v7().simple().to_string();
    // v7 leads with the timestamp; the tail is random
    let hex_suffix = &uuid[uuid.len() - 6..];
    let slug = slugify(title);
    if slug.is_empty() {
        format!("{}-{}", hex_suffix, domain_type)
    } else {
        format!("{}-{}-{}", hex_suffix, domain_type, slug)
    }
}

/// Generate a unique trace ID
pub fn generate_trace_id() -> String {
    format!("trace_{}", uuid::Uuid::now_v7().simple())
}

/// Generate a single-use binding token (32 hex chars)
pub fn generate_binding_token() -> String {
    to_hex(&rand::random::<[u8; 16]>())
}

/// Generate the secret an upstream agent presents on connect (64 hex chars)
pub fn generate_agent_token() -> String {
    to_hex(&rand::random::<[u8; 32]>())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}

fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .filter(|c| *c != '\'')
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_format() {
        let id = generate_id("dest", "Kitchen Glasses");
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 6);
        assert!(parts[0].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(parts[1], "dest");
        assert_eq!(parts[2], "kitchen-glasses");
    }

    #[test]
    fn test_generate_id_empty_title() {
        let id = generate_id("dest", "!!!");
        assert!(id.ends_with("-dest"));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Bob's  Lab / Desk"), "bobs-lab-desk");
        assert_eq!(slugify("--x--"), "x");
    }

    #[test]
    fn test_secret_lengths() {
        let token = generate_binding_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

        let agent = generate_agent_token();
        assert_eq!(agent.len(), 64);
        assert_ne!(generate_binding_token(), token);
    }

    #[test]
    fn test_trace_ids_unique() {
        let a = generate_trace_id();
        let b = generate_trace_id();
        assert!(a.starts_with("trace_"));
        assert_ne!(a, b);
    }
}

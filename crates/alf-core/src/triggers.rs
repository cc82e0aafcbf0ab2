//! Fixed patterns that mark a message as carrying enrichable evidence.

use std::sync::OnceLock;

use regex::Regex;

/// Slack wraps links as `<http://...>`; we match on the lower-cased text.
pub const LINK_MARKER: &str = "<http";

/// Precompiled trigger patterns.
///
/// Boundaries are ASCII word boundaries: a 40-char digest never matches the
/// 32-char pattern, and hex runs glued to other letters or digits are ignored.
/// IPv4 octets are not range-checked (`999.999.999.999` matches).
#[derive(Debug)]
pub struct TriggerSet {
    ipv4: Regex,
    md5: Regex,
    sha1: Regex,
    sha256: Regex,
}

impl TriggerSet {
    fn compile() -> Self {
        let re = |p: &str| Regex::new(p).expect("valid regex");
        Self {
            ipv4: re(r"(?-u:\b)[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}(?-u:\b)"),
            md5: re(r"(?-u:\b)[a-fA-F0-9]{32}(?-u:\b)"),
            sha1: re(r"(?-u:\b)[a-fA-F0-9]{40}(?-u:\b)"),
            sha256: re(r"(?-u:\b)[a-fA-F0-9]{64}(?-u:\b)"),
        }
    }

    /// Process-wide instance, compiled on first use.
    pub fn shared() -> &'static TriggerSet {
        static SET: OnceLock<TriggerSet> = OnceLock::new();
        SET.get_or_init(TriggerSet::compile)
    }

    pub fn has_link(&self, text: &str) -> bool {
        text.to_lowercase().contains(LINK_MARKER)
    }

    pub fn has_ipv4(&self, text: &str) -> bool {
        self.ipv4.is_match(text)
    }

    pub fn has_digest(&self, text: &str) -> bool {
        self.md5.is_match(text) || self.sha1.is_match(text) || self.sha256.is_match(text)
    }

    pub fn matches(&self, text: &str) -> bool {
        self.has_link(text) || self.has_ipv4(text) || self.has_digest(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_without_range_check() {
        let t = TriggerSet::shared();
        assert!(t.has_ipv4("ping 10.0.0.1 now"));
        assert!(t.has_ipv4("999.999.999.999"));
        assert!(!t.has_ipv4("1.2.3"));
        assert!(!t.has_ipv4("version 1234.1.1.1"));
    }

    #[test]
    fn digests_need_exact_length() {
        let t = TriggerSet::shared();
        let md5 = "d41d8cd98f00b204e9800998ecf8427e";
        let sha1 = "da39a3ee5e6b4b0d3255bfef95601890afd80709";
        let sha256 = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        assert!(t.has_digest(md5));
        assert!(t.has_digest(&md5.to_uppercase()));
        assert!(t.has_digest(&format!("hash: {sha1}.")));
        assert!(t.has_digest(sha256));
        assert!(!t.has_digest(&md5[..31]));
        assert!(!t.has_digest(&format!("{md5}0")));
        assert!(!t.has_digest(&format!("x{md5}")));
    }

    #[test]
    fn link_marker_is_case_insensitive() {
        let t = TriggerSet::shared();
        assert!(t.matches("see <HTTPS://example.com>"));
        assert!(!t.matches("see example.com"));
    }
}

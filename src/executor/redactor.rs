//! Secret redaction for captured command output before it reaches logs.

use regex::Regex;

/// Canonical replacement marker for redacted content.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Redacts known secret values and password-like assignments from output text.
#[derive(Debug, Clone)]
pub struct Redactor {
    exact_secrets: Vec<String>,
    patterns: Vec<Regex>,
}

impl Redactor {
    /// Create a redactor from known secret values.
    pub fn new(exact_secrets: Vec<String>) -> Self {
        let patterns = default_patterns();
        Self {
            exact_secrets,
            patterns,
        }
    }

    /// Redact exact known secrets and known secret patterns.
    pub fn redact(&self, text: &str) -> String {
        let mut sanitized = text.to_owned();
        for secret in &self.exact_secrets {
            if !secret.is_empty() {
                sanitized = sanitized.replace(secret, REDACTION_MARKER);
            }
        }
        for pattern in &self.patterns {
            sanitized = pattern
                .replace_all(&sanitized, format!("${{key}}={REDACTION_MARKER}"))
                .to_string();
        }
        sanitized
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn default_patterns() -> Vec<Regex> {
    let patterns = [
        r"(?i)(?P<key>MYSQL_PWD|MYSQL_PASSWORD|MYSQL_ROOT_PASSWORD)=\S+",
        r"(?i)(?P<key>--password)=\S+",
    ];

    patterns
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
}

//! Rate key generation and handling.

/// Default prefix for window keys in the shared store.
pub const DEFAULT_KEY_PREFIX: &str = "rate";

/// A key that uniquely identifies one independently limited quota.
///
/// The key is the exact (subject, resource) pair. No normalization is applied,
/// so `"Alice"` and `"alice"` are different subjects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    /// The caller identity (e.g. a user id)
    pub subject: String,
    /// The limited resource (e.g. an endpoint name)
    pub resource: String,
}

impl RateKey {
    /// Create a new rate key.
    pub fn new(subject: &str, resource: &str) -> Self {
        Self {
            subject: subject.to_string(),
            resource: resource.to_string(),
        }
    }

    /// Render the key used for this quota's window in the shared store.
    ///
    /// Format: `{prefix}:{subject}:{resource}`. Backslashes and colons inside
    /// the subject or resource are backslash-escaped, so two different pairs
    /// can never render to the same store key.
    pub fn to_store_key(&self, prefix: &str) -> String {
        format!(
            "{}:{}:{}",
            prefix,
            escape_component(&self.subject),
            escape_component(&self.resource)
        )
    }
}

impl std::fmt::Display for RateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.subject, self.resource)
    }
}

fn escape_component(raw: &str) -> String {
    if !raw.contains(['\\', ':']) {
        return raw.to_string();
    }

    let mut escaped = String::with_capacity(raw.len() + 4);
    for c in raw.chars() {
        if c == '\\' || c == ':' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

use crate::gateway::crypto::short_hash;

/// Sensitive words every deployment checks, before configured extras.
pub const BUILTIN_SENSITIVE_WORDS: &[&str] = &["test_sensitive"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeywordMatch {
    /// `sensitive` for the built-in list, `policy` for configured keywords.
    pub source: &'static str,
    /// Short SHA-256 of the matched keyword; the keyword itself is never recorded.
    pub hash: String,
}

#[derive(Clone, Debug, Default)]
pub struct KeywordPolicy {
    extra: Vec<String>,
}

impl KeywordPolicy {
    pub fn new(extra: &[String]) -> Self {
        let extra = extra
            .iter()
            .map(|word| word.trim().to_lowercase())
            .filter(|word| !word.is_empty())
            .collect();
        Self { extra }
    }

    /// Case-insensitive containment; the first hit wins.
    pub fn find(&self, text: &str) -> Option<KeywordMatch> {
        let content = text.to_lowercase();
        if let Some(word) = BUILTIN_SENSITIVE_WORDS
            .iter()
            .find(|word| content.contains(*word))
        {
            return Some(KeywordMatch {
                source: "sensitive",
                hash: short_hash(word, 16),
            });
        }
        self.extra
            .iter()
            .find(|word| content.contains(word.as_str()))
            .map(|word| KeywordMatch {
                source: "policy",
                hash: short_hash(word, 16),
            })
    }
}

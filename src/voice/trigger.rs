//! Trigger phrase matching
//!
//! A trigger is a literal phrase whose appearance anywhere in a transcript
//! fires. Matching is case-insensitive substring search.

/// Normalized set of trigger phrases
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerPhrases {
    phrases: Vec<String>,
}

impl TriggerPhrases {
    /// Normalize phrases to lowercase, trimmed, dropping empty ones
    #[must_use]
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let phrases = phrases
            .into_iter()
            .map(|p| p.as_ref().trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();

        Self { phrases }
    }

    /// First configured phrase contained in `transcript`
    #[must_use]
    pub fn find_in(&self, transcript: &str) -> Option<&str> {
        let normalized = transcript.to_lowercase();
        self.phrases
            .iter()
            .find(|phrase| normalized.contains(phrase.as_str()))
            .map(String::as_str)
    }

    /// The normalized phrases
    #[must_use]
    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    /// Whether nothing can ever match
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }
}

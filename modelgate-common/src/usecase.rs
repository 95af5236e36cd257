//! Usecase flags for model configurations.
//!
//! A usecase is a capability tag used to filter models for a given endpoint
//! (chat, embeddings, transcription, ...). Configs may declare their
//! usecases explicitly; otherwise they are guessed from the config shape.

use serde::{Deserialize, Serialize};

/// Bitmask of endpoint capabilities a model can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Usecase(pub u32);

impl Usecase {
    pub const ANY: Usecase = Usecase(0);
    pub const CHAT: Usecase = Usecase(1 << 0);
    pub const COMPLETION: Usecase = Usecase(1 << 1);
    pub const EDIT: Usecase = Usecase(1 << 2);
    pub const EMBEDDINGS: Usecase = Usecase(1 << 3);
    pub const RERANK: Usecase = Usecase(1 << 4);
    pub const IMAGE: Usecase = Usecase(1 << 5);
    pub const TRANSCRIPT: Usecase = Usecase(1 << 6);
    pub const TTS: Usecase = Usecase(1 << 7);
    pub const SOUND_GENERATION: Usecase = Usecase(1 << 8);
    pub const TOKENIZE: Usecase = Usecase(1 << 9);
    pub const VAD: Usecase = Usecase(1 << 10);
    pub const VIDEO: Usecase = Usecase(1 << 11);
    pub const DETECTION: Usecase = Usecase(1 << 12);

    /// Chat, completion and edit together.
    pub const LLM: Usecase =
        Usecase(Self::CHAT.0 | Self::COMPLETION.0 | Self::EDIT.0);

    /// All named flags with their YAML spelling. `ANY` is intentionally
    /// excluded: it is zero and would match every `covers` check.
    pub const NAMED: [(&'static str, Usecase); 14] = [
        ("chat", Self::CHAT),
        ("completion", Self::COMPLETION),
        ("edit", Self::EDIT),
        ("embeddings", Self::EMBEDDINGS),
        ("rerank", Self::RERANK),
        ("image", Self::IMAGE),
        ("transcript", Self::TRANSCRIPT),
        ("tts", Self::TTS),
        ("sound_generation", Self::SOUND_GENERATION),
        ("tokenize", Self::TOKENIZE),
        ("vad", Self::VAD),
        ("video", Self::VIDEO),
        ("detection", Self::DETECTION),
        ("llm", Self::LLM),
    ];

    /// True iff every flag in `other` is present in `self`.
    pub fn covers(self, other: Usecase) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Usecase) -> Usecase {
        Usecase(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Parse a single YAML usecase name, case-insensitive.
    /// Unknown names yield `None` and are skipped by callers.
    pub fn from_name(name: &str) -> Option<Usecase> {
        let lower = name.to_ascii_lowercase();
        Self::NAMED
            .iter()
            .find(|(n, _)| *n == lower)
            .map(|(_, u)| *u)
    }

    /// Combine a list of YAML names into one mask. `None` when the list is
    /// empty, which is the signal that no usecases were declared at all.
    pub fn from_names(names: &[String]) -> Option<Usecase> {
        if names.is_empty() {
            return None;
        }
        let mut mask = Usecase::ANY;
        for name in names {
            if let Some(u) = Self::from_name(name) {
                mask = mask.union(u);
            }
        }
        Some(mask)
    }

    /// Canonical names for every individual flag present in the mask.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(n, u)| *n != "llm" && !u.is_empty() && self.covers(*u))
            .map(|(n, _)| *n)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covers() {
        assert!(Usecase::LLM.covers(Usecase::CHAT));
        assert!(Usecase::LLM.covers(Usecase::COMPLETION));
        assert!(!Usecase::CHAT.covers(Usecase::LLM));
        // ANY is covered by everything
        assert!(Usecase::CHAT.covers(Usecase::ANY));
    }

    #[test]
    fn test_from_name_case_insensitive() {
        assert_eq!(Usecase::from_name("CHAT"), Some(Usecase::CHAT));
        assert_eq!(Usecase::from_name("tts"), Some(Usecase::TTS));
        assert_eq!(Usecase::from_name("nonsense"), None);
    }

    #[test]
    fn test_from_names_empty_is_none() {
        assert_eq!(Usecase::from_names(&[]), None);
    }

    #[test]
    fn test_from_names_combines() {
        let mask = Usecase::from_names(&[
            "chat".to_string(),
            "embeddings".to_string(),
            "bogus".to_string(),
        ])
        .unwrap();
        assert!(mask.covers(Usecase::CHAT));
        assert!(mask.covers(Usecase::EMBEDDINGS));
        assert!(!mask.covers(Usecase::EDIT));
    }

    #[test]
    fn test_names_round_trip() {
        let mask = Usecase::CHAT.union(Usecase::VAD);
        let names: Vec<String> = mask.names().iter().map(|s| s.to_string()).collect();
        assert_eq!(Usecase::from_names(&names), Some(mask));
    }
}

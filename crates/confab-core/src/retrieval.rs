//! Reactive-retrieval support: keyword hygiene and the per-channel memo
//! that feeds the previous parameters and result back into the next
//! parameterization prompt.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};

/// Per-channel record of the last search: parameters as the model emitted
/// them and the rendered result text. Both start as "None" so the first
/// parameterization prompt reads naturally.
#[derive(Debug, Clone)]
pub struct RetrievalMemo {
    pub params: String,
    pub result: String,
}

impl Default for RetrievalMemo {
    fn default() -> Self {
        Self {
            params: "None".to_string(),
            result: "None".to_string(),
        }
    }
}

impl RetrievalMemo {
    pub fn record(&mut self, params: &str, result: &str) {
        self.params = params.to_string();
        self.result = result.to_string();
    }
}

/// Words subtracted from every keyword set before the SQL search. The
/// deployment may supply its own list; this built-in set keeps hygiene
/// working without one.
#[derive(Debug, Clone)]
pub struct Stopwords {
    words: BTreeSet<String>,
}

const BUILTIN_STOPWORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "by", "did", "do", "does", "for", "from",
    "had", "has", "have", "he", "her", "his", "how", "i", "in", "is", "it", "its", "me", "my",
    "of", "on", "or", "she", "that", "the", "their", "them", "they", "this", "to", "was", "we",
    "were", "what", "when", "where", "which", "who", "will", "with", "you", "your",
];

impl Default for Stopwords {
    fn default() -> Self {
        Self {
            words: BUILTIN_STOPWORDS.iter().map(|w| w.to_string()).collect(),
        }
    }
}

impl Stopwords {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read stopwords file: {}", path.display()))?;
        Ok(Self {
            words: content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_lowercase)
                .collect(),
        })
    }

    pub fn from_config(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn contains(&self, word: &str) -> bool {
        self.words.contains(word)
    }
}

/// Lower-case the raw keyword string, split on `/`, whitespace, apostrophes
/// and quotes, and subtract stopwords. An empty result means the channel
/// renders no rows this turn.
pub fn keyword_set(raw: &str, stopwords: &Stopwords) -> BTreeSet<String> {
    raw.to_lowercase()
        .split(['/', ' ', '\t', '\n', '\'', '"'])
        .map(str::trim)
        .filter(|word| !word.is_empty())
        .filter(|word| !stopwords.contains(word))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn memo_defaults_to_none() {
        let memo = RetrievalMemo::default();
        assert_eq!(memo.params, "None");
        assert_eq!(memo.result, "None");
    }

    #[test]
    fn memo_records_last_search() {
        let mut memo = RetrievalMemo::default();
        memo.record("{\"keyword\": \"ring\"}", "from Bob to Alice: the ring");
        assert!(memo.params.contains("ring"));
        assert!(memo.result.contains("from Bob"));
    }

    #[test]
    fn keywords_split_on_all_separators() {
        let stopwords = Stopwords::default();
        let set = keyword_set("Ring/Alice's \"steal\"", &stopwords);
        assert_eq!(
            set,
            ["ring", "alice", "s", "steal"]
                .into_iter()
                .map(str::to_string)
                .collect()
        );
    }

    #[test]
    fn stopwords_are_subtracted() {
        let stopwords = Stopwords::default();
        let set = keyword_set("the book of dune", &stopwords);
        assert_eq!(
            set,
            ["book", "dune"].into_iter().map(str::to_string).collect()
        );
    }

    #[test]
    fn all_stopwords_yield_empty_set() {
        let stopwords = Stopwords::default();
        assert!(keyword_set("the of and", &stopwords).is_empty());
        assert!(keyword_set("", &stopwords).is_empty());
    }

    #[test]
    fn stopwords_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Dune\n  ring  \n").unwrap();
        let stopwords = Stopwords::load(file.path()).unwrap();
        assert!(stopwords.contains("dune"));
        assert!(stopwords.contains("ring"));
        assert!(!stopwords.contains("book"));

        let set = keyword_set("dune book", &stopwords);
        assert_eq!(set, ["book"].into_iter().map(str::to_string).collect());
    }
}

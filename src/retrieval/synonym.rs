//! Synonym expansion for keyword-side recall.
//!
//! Combines a line-based custom dictionary with an optional WordNet export
//! loaded through the same format. Lookups are cached with a bounded
//! least-recently-used discipline.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

/// Shared stop list, also used by the keyword tokenizer and query expansion.
pub static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have",
        "how", "in", "is", "it", "its", "of", "on", "or", "that", "the", "this", "to", "was",
        "what", "when", "where", "which", "who", "why", "will", "with",
    ]
    .into_iter()
    .collect()
});

const DEFAULT_MAX_SYNONYMS: usize = 5;

struct CachedLookup {
    synonyms: Vec<String>,
    last_used: Instant,
}

/// Dictionary-backed synonym service with a bounded LRU cache.
pub struct SynonymService {
    dictionary: HashMap<String, BTreeSet<String>>,
    max_synonyms: usize,
    cache: DashMap<String, CachedLookup>,
    cache_capacity: usize,
    wordnet_loaded: bool,
}

impl SynonymService {
    pub fn new(
        custom_dict_path: Option<&Path>,
        wordnet_path: Option<&Path>,
        max_synonyms: usize,
    ) -> Self {
        let mut dictionary = HashMap::new();
        let mut wordnet_loaded = false;

        if let Some(path) = custom_dict_path {
            match std::fs::read_to_string(path) {
                Ok(text) => Self::load_lines(&mut dictionary, &text),
                Err(e) => warn!("failed to load synonym dictionary {}: {}", path.display(), e),
            }
        }
        if let Some(path) = wordnet_path {
            match std::fs::read_to_string(path) {
                Ok(text) => {
                    Self::load_lines(&mut dictionary, &text);
                    wordnet_loaded = true;
                }
                Err(e) => warn!("failed to load WordNet export {}: {}", path.display(), e),
            }
        }

        info!(
            "synonym service: {} terms, wordnet={}",
            dictionary.len(),
            wordnet_loaded
        );

        Self {
            dictionary,
            max_synonyms: if max_synonyms == 0 {
                DEFAULT_MAX_SYNONYMS
            } else {
                max_synonyms
            },
            cache: DashMap::new(),
            cache_capacity: 1000,
            wordnet_loaded,
        }
    }

    pub fn empty() -> Self {
        Self::new(None, None, DEFAULT_MAX_SYNONYMS)
    }

    pub fn wordnet_available(&self) -> bool {
        self.wordnet_loaded
    }

    /// Accepts `word: syn, syn` or `word syn syn`; `#` starts a comment.
    fn load_lines(dictionary: &mut HashMap<String, BTreeSet<String>>, text: &str) {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (word, synonyms): (String, Vec<String>) = match line.split_once(':') {
                Some((word, rest)) => (
                    word.trim().to_lowercase(),
                    rest.split(',').map(|s| s.trim().to_lowercase()).collect(),
                ),
                None => {
                    let mut parts = line.split_whitespace();
                    let Some(word) = parts.next() else { continue };
                    (
                        word.to_lowercase(),
                        parts.map(|s| s.to_lowercase()).collect(),
                    )
                }
            };

            if synonyms.is_empty() {
                continue;
            }
            let entry = dictionary.entry(word.clone()).or_default();
            for synonym in synonyms {
                if !synonym.is_empty() && synonym != word {
                    entry.insert(synonym);
                }
            }
        }
    }

    /// Synonyms for one word, deterministically sorted and truncated.
    pub fn lookup(&self, word: &str) -> Vec<String> {
        let key = word.to_lowercase();

        if let Some(mut cached) = self.cache.get_mut(&key) {
            cached.last_used = Instant::now();
            return cached.synonyms.clone();
        }

        let synonyms: Vec<String> = self
            .dictionary
            .get(&key)
            .map(|set| set.iter().take(self.max_synonyms).cloned().collect())
            .unwrap_or_default();

        self.cache.insert(
            key,
            CachedLookup {
                synonyms: synonyms.clone(),
                last_used: Instant::now(),
            },
        );
        if self.cache.len() > self.cache_capacity {
            self.evict_least_recently_used();
        }

        synonyms
    }

    fn evict_least_recently_used(&self) {
        let over = self.cache.len().saturating_sub(self.cache_capacity);
        if over == 0 {
            return;
        }
        let mut by_use: Vec<(String, Instant)> = self
            .cache
            .iter()
            .map(|e| (e.key().clone(), e.value().last_used))
            .collect();
        by_use.sort_by_key(|(_, used)| *used);
        for (key, _) in by_use.into_iter().take(over) {
            self.cache.remove(&key);
        }
    }

    /// Append synonyms for the query's significant words. Short words and
    /// stop words are skipped.
    pub fn expand_query(&self, query: &str, max_expansions: usize) -> String {
        let mut expanded = query.to_string();
        let mut added = 0usize;

        for word in query.split_whitespace() {
            if added >= max_expansions {
                break;
            }
            let cleaned: String = word
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if cleaned.len() < 3 || STOP_WORDS.contains(cleaned.as_str()) {
                continue;
            }
            for synonym in self.lookup(&cleaned) {
                if added >= max_expansions {
                    break;
                }
                if !expanded.to_lowercase().contains(&synonym) {
                    expanded.push(' ');
                    expanded.push_str(&synonym);
                    added += 1;
                }
            }
        }

        expanded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn service_with(dict: &str) -> SynonymService {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(dict.as_bytes()).unwrap();
        SynonymService::new(Some(file.path()), None, 5)
    }

    #[test]
    fn parses_both_line_formats() {
        let service = service_with("car: automobile, vehicle\nfast quick rapid\n# comment\n");
        assert_eq!(service.lookup("car"), vec!["automobile", "vehicle"]);
        assert_eq!(service.lookup("fast"), vec!["quick", "rapid"]);
        assert!(service.lookup("unknown").is_empty());
    }

    #[test]
    fn lookups_are_case_insensitive_and_sorted() {
        let service = service_with("db: postgres, mysql, sqlite\n");
        // BTreeSet ordering is deterministic
        assert_eq!(service.lookup("DB"), vec!["mysql", "postgres", "sqlite"]);
    }

    #[test]
    fn truncates_to_max() {
        let service = {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(b"x: a, b, c, d, e, f, g\n").unwrap();
            SynonymService::new(Some(file.path()), None, 3)
        };
        assert_eq!(service.lookup("x").len(), 3);
    }

    #[test]
    fn expand_query_skips_stop_and_short_words() {
        let service = service_with("car: automobile\nthe: never\nis: nope\n");
        let expanded = service.expand_query("what is the car", 5);
        assert!(expanded.contains("automobile"));
        assert!(!expanded.contains("never"));
        assert!(!expanded.contains("nope"));
    }

    #[test]
    fn expansion_respects_the_budget() {
        let service = service_with("alpha: one, two, three\nbeta: four, five\n");
        let expanded = service.expand_query("alpha beta", 2);
        let extra_words = expanded.split_whitespace().count() - 2;
        assert!(extra_words <= 2);
    }

    #[test]
    fn missing_dictionary_degrades_to_empty() {
        let service = SynonymService::new(Some(Path::new("/nonexistent/dict.txt")), None, 5);
        assert!(service.lookup("anything").is_empty());
        assert!(!service.wordnet_available());
    }
}

//! Pattern index and best-match lookup.
//!
//! # Responsibilities
//! - Store (pattern → payload) entries
//! - Find the most specific pattern matching a message
//!
//! # Design Decisions
//! - Inverted index keyed by (field, canonical value); lookup only visits
//!   patterns that share at least one field/value with the message
//! - A pattern matches when all of its constraints were hit
//! - Most constrained keys wins; ties go to the earliest registration
//! - Re-adding an existing pattern replaces the payload, keeps its order

use std::collections::HashMap;

use serde_json::Value;

use crate::routing::pattern::{canonical_json, Pattern};

#[derive(Debug)]
struct Entry<T> {
    seq: u64,
    payload: T,
}

/// Matcher holding (pattern → payload) entries.
#[derive(Debug)]
pub struct PatternIndex<T> {
    entries: HashMap<Pattern, Entry<T>>,
    /// field → canonical value → patterns constraining that pair.
    postings: HashMap<String, HashMap<String, Vec<Pattern>>>,
    /// Patterns without constraints.
    wildcards: Vec<Pattern>,
    next_seq: u64,
}

impl<T> Default for PatternIndex<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            postings: HashMap::new(),
            wildcards: Vec::new(),
            next_seq: 0,
        }
    }
}

impl<T> PatternIndex<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns true when the pattern was not present.
    pub fn add(&mut self, pattern: Pattern, payload: T) -> bool {
        if let Some(entry) = self.entries.get_mut(&pattern) {
            entry.payload = payload;
            return false;
        }

        if pattern.is_empty() {
            self.wildcards.push(pattern.clone());
        } else {
            for (key, value) in pattern.fields() {
                self.postings
                    .entry(key.to_string())
                    .or_default()
                    .entry(canonical_json(value))
                    .or_default()
                    .push(pattern.clone());
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(pattern, Entry { seq, payload });
        true
    }

    /// Remove a pattern, returning its payload.
    pub fn remove(&mut self, pattern: &Pattern) -> Option<T> {
        let entry = self.entries.remove(pattern)?;

        if pattern.is_empty() {
            self.wildcards.retain(|p| p != pattern);
        } else {
            for (key, value) in pattern.fields() {
                let Some(values) = self.postings.get_mut(key) else {
                    continue;
                };
                let canonical = canonical_json(value);
                if let Some(list) = values.get_mut(&canonical) {
                    list.retain(|p| p != pattern);
                    if list.is_empty() {
                        values.remove(&canonical);
                    }
                }
                if values.is_empty() {
                    self.postings.remove(key);
                }
            }
        }

        Some(entry.payload)
    }

    /// Best match for `message`, or `None`.
    pub fn lookup(&self, message: &Value) -> Option<(&Pattern, &T)> {
        let mut best: Option<(&Pattern, &Entry<T>)> = None;
        let mut consider = |pattern: &Pattern| {
            if let Some((stored, entry)) = self.entries.get_key_value(pattern) {
                let better = match best {
                    None => true,
                    Some((current, current_entry)) => {
                        stored.len() > current.len()
                            || (stored.len() == current.len() && entry.seq < current_entry.seq)
                    }
                };
                if better {
                    best = Some((stored, entry));
                }
            }
        };

        if let Some(fields) = message.as_object() {
            let mut hits: HashMap<&Pattern, usize> = HashMap::new();
            for (key, value) in fields {
                let Some(values) = self.postings.get(key.as_str()) else {
                    continue;
                };
                if let Some(list) = values.get(&canonical_json(value)) {
                    for pattern in list {
                        *hits.entry(pattern).or_insert(0) += 1;
                    }
                }
            }
            for (pattern, count) in hits {
                if count == pattern.len() {
                    consider(pattern);
                }
            }
            for pattern in &self.wildcards {
                consider(pattern);
            }
        }

        best.map(|(pattern, entry)| (pattern, &entry.payload))
    }

    pub fn get(&self, pattern: &Pattern) -> Option<&T> {
        self.entries.get(pattern).map(|e| &e.payload)
    }

    pub fn contains(&self, pattern: &Pattern) -> bool {
        self.entries.contains_key(pattern)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Patterns in registration order.
    pub fn patterns(&self) -> Vec<Pattern> {
        let mut all: Vec<_> = self.entries.iter().map(|(p, e)| (e.seq, p.clone())).collect();
        all.sort_by_key(|(seq, _)| *seq);
        all.into_iter().map(|(_, p)| p).collect()
    }
}

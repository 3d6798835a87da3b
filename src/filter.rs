//! Persistence eligibility rules.
//!
//! Rules run in order and the first failing one rejects:
//!
//! 1. With a non-empty include list, a keyword run must come from a listed
//!    process. Screenshots skip this rule.
//! 2. A keyword run containing any exclude word is rejected whole. Nothing
//!    is redacted in place, so no partial line is ever stored.

use crate::collector::{CaptureEvent, KeywordEvent};
use crate::config::Config;

/// Outcome of evaluating one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Admit,
    /// Keyword run typed into a process outside the include list
    ProcessNotIncluded,
    /// Keyword run containing an excluded word
    ExcludedWord,
}

impl FilterDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, FilterDecision::Admit)
    }
}

/// Immutable filter built from the configuration at startup.
#[derive(Debug, Clone)]
pub struct FilterEngine {
    include_processes: Vec<String>,
    exclude_words: Vec<String>,
}

impl FilterEngine {
    pub fn new(config: &Config) -> Self {
        Self::from_lists(&config.include_processes, &config.exclude_words)
    }

    pub fn from_lists(include_processes: &[String], exclude_words: &[String]) -> Self {
        Self {
            include_processes: normalize(include_processes),
            exclude_words: normalize(exclude_words),
        }
    }

    pub fn admit(&self, event: &CaptureEvent) -> bool {
        self.decide(event).is_admitted()
    }

    pub fn decide(&self, event: &CaptureEvent) -> FilterDecision {
        match event {
            CaptureEvent::Screenshot(_) => FilterDecision::Admit,
            CaptureEvent::Keyword(run) => self.decide_keyword(run),
        }
    }

    fn decide_keyword(&self, run: &KeywordEvent) -> FilterDecision {
        if !self.include_processes.is_empty() && !self.process_included(&run.process_name) {
            return FilterDecision::ProcessNotIncluded;
        }

        let text = run.text.to_lowercase();
        if self.exclude_words.iter().any(|word| text.contains(word)) {
            return FilterDecision::ExcludedWord;
        }

        FilterDecision::Admit
    }

    fn process_included(&self, process_name: &str) -> bool {
        let name = process_name.to_lowercase();
        let name = name.strip_suffix(".exe").unwrap_or(&name);
        self.include_processes
            .iter()
            .any(|entry| name.contains(entry.as_str()))
    }
}

/// Lowercase and trim entries, dropping blanks.
fn normalize(entries: &[String]) -> Vec<String> {
    entries
        .iter()
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

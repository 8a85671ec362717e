//! Structured record queries and their reference matching semantics.
//!
//! A query's free-text expression is a list of whitespace-separated terms,
//! all of which must appear as whole tokens in the record text
//! (case-insensitive). `any_text` is a disjunction of such expressions and
//! is how the rule-metrics engine counts the union of several rules' matched
//! sets with a single index round-trip.
//!
//! An empty query matches every record. Index backends must implement these
//! semantics; [`RecordQuery::matches`] is the reference implementation used
//! by the in-memory backend and by tests.

use serde::{Deserialize, Serialize};

use crate::models::{Record, RecordStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    /// Free-text expression; all terms must match. Empty means match-all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Disjunction of free-text expressions; a record matches when any of
    /// them does. Combined with `text` conjunctively.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any_text: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status: Vec<RecordStatus>,
    /// Only records whose validated annotation asserts one of these labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotated_as: Vec<String>,
    /// Only records with a prediction asserting one of these labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predicted_as: Vec<String>,
    /// `Some(true)`: only annotated records; `Some(false)`: only
    /// unannotated ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotated: Option<bool>,
}

impl RecordQuery {
    pub fn match_all() -> Self {
        Self::default()
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Union query over several rule expressions.
    pub fn any_of(exprs: impl IntoIterator<Item = String>) -> Self {
        Self {
            any_text: exprs.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_annotated(mut self, annotated: bool) -> Self {
        self.annotated = Some(annotated);
        self
    }

    /// Normalize the query: trim the text expression and drop it entirely
    /// when blank, so an absent and an empty query are the same match-all.
    /// A blank member of `any_text` matches everything, so the whole
    /// disjunction collapses to match-all.
    pub fn normalized(mut self) -> Self {
        self.text = self
            .text
            .take()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if self.any_text.iter().any(|t| t.trim().is_empty()) {
            self.any_text.clear();
        }
        self
    }

    pub fn is_match_all(&self) -> bool {
        self.text.is_none()
            && self.any_text.is_empty()
            && self.status.is_empty()
            && self.annotated_as.is_empty()
            && self.predicted_as.is_empty()
            && self.annotated.is_none()
    }

    /// Reference matching semantics, shared by the in-memory backend.
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(text) = &self.text {
            if !expression_matches(text, record.text()) {
                return false;
            }
        }
        if !self.any_text.is_empty()
            && !self
                .any_text
                .iter()
                .any(|expr| expression_matches(expr, record.text()))
        {
            return false;
        }
        if !self.status.is_empty() && !self.status.contains(&record.status) {
            return false;
        }
        if let Some(wanted) = self.annotated {
            if record.is_annotated() != wanted {
                return false;
            }
        }
        if !self.annotated_as.is_empty() {
            let labels = record.annotated_labels();
            if !self.annotated_as.iter().any(|l| labels.contains(&l.as_str())) {
                return false;
            }
        }
        if !self.predicted_as.is_empty() {
            let labels = record.predicted_labels();
            if !self.predicted_as.iter().any(|l| labels.contains(&l.as_str())) {
                return false;
            }
        }
        true
    }
}

/// Whether all terms of `expr` appear as whole tokens in `haystack`,
/// case-insensitively. A blank expression matches everything.
pub fn expression_matches(expr: &str, haystack: &str) -> bool {
    let terms: Vec<String> = expr
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect();
    if terms.is_empty() {
        return true;
    }
    let tokens: Vec<String> = haystack
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();
    terms.iter().all(|term| tokens.iter().any(|tok| tok == term))
}

//! Filter evaluation and director-trigger dedupe.
//!
//! Filters are compiled once per cycle. Patterns match case-insensitively
//! against one envelope field; a pattern that fails to compile never
//! matches and is reported once through `invalid()`.

use std::collections::HashSet;

use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::model::{Envelope, Filter, FilterField};

/// Text a filter on `field` is matched against.
pub fn field_value(envelope: &Envelope, field: FilterField) -> String {
    match field {
        FilterField::From => envelope.from.clone(),
        FilterField::To => envelope.to.clone(),
        FilterField::Cc => envelope.cc.clone(),
        FilterField::Bcc => envelope.bcc.clone(),
        FilterField::Subject => envelope.subject.clone(),
        FilterField::Body => format!("{}\n{}", envelope.snippet, envelope.body),
        FilterField::Date => envelope
            .date
            .map(|d| d.to_rfc3339())
            .unwrap_or_default(),
    }
}

/// A director to run for a message, and the filter that selected it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorTrigger {
    pub director_id: String,
    pub filter_id: String,
}

#[derive(Debug, Clone)]
struct CompiledFilter {
    id: String,
    field: FilterField,
    /// `None` when the pattern did not compile.
    regex: Option<Regex>,
    director_id: String,
    duplicate_allowed: bool,
}

/// Enabled filters of one tenant, in stored order.
#[derive(Debug, Clone, Default)]
pub struct CompiledFilters {
    filters: Vec<CompiledFilter>,
    invalid: Vec<(String, String)>,
}

impl CompiledFilters {
    pub fn compile(filters: &[Filter]) -> Self {
        let mut compiled = Self::default();
        for filter in filters.iter().filter(|f| f.enabled) {
            let regex = match RegexBuilder::new(&filter.regex)
                .case_insensitive(true)
                .build()
            {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!(filter = %filter.id, pattern = %filter.regex, error = %e, "Invalid filter pattern");
                    compiled.invalid.push((filter.id.clone(), e.to_string()));
                    None
                }
            };
            compiled.filters.push(CompiledFilter {
                id: filter.id.clone(),
                field: filter.field,
                regex,
                director_id: filter.director_id.clone(),
                duplicate_allowed: filter.duplicate_allowed,
            });
        }
        compiled
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// `(filter_id, error)` for every pattern that failed to compile.
    pub fn invalid(&self) -> &[(String, String)] {
        &self.invalid
    }

    /// Directors to trigger for `envelope`, in filter order.
    ///
    /// A `duplicate_allowed` match always triggers. Otherwise the first
    /// match for a director suppresses later non-duplicate matches for that
    /// director on the same message.
    pub fn director_triggers(&self, envelope: &Envelope) -> Vec<DirectorTrigger> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut triggers = Vec::new();
        for filter in &self.filters {
            let Some(regex) = &filter.regex else {
                continue;
            };
            if !regex.is_match(&field_value(envelope, filter.field)) {
                continue;
            }
            if !filter.duplicate_allowed && !seen.insert(filter.director_id.as_str()) {
                debug!(
                    filter = %filter.id,
                    director = %filter.director_id,
                    message = %envelope.id,
                    "Suppressed duplicate director trigger"
                );
                continue;
            }
            triggers.push(DirectorTrigger {
                director_id: filter.director_id.clone(),
                filter_id: filter.id.clone(),
            });
        }
        triggers
    }
}

//! User-defined routing rules.

use serde::{Deserialize, Serialize};

/// Which envelope field a filter's regex is tested against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterField {
    From,
    To,
    Cc,
    Bcc,
    Subject,
    Body,
    Date,
}

/// A rule routing matching messages to a director.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub id: String,
    pub field: FilterField,
    pub regex: String,
    pub director_id: String,
    /// When false, the first match for `director_id` on a message suppresses
    /// later non-duplicate matches for the same director.
    #[serde(default)]
    pub duplicate_allowed: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Filter {
    pub fn new(
        id: impl Into<String>,
        field: FilterField,
        regex: impl Into<String>,
        director_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            field,
            regex: regex.into(),
            director_id: director_id.into(),
            duplicate_allowed: false,
            enabled: true,
        }
    }

    pub fn allow_duplicates(mut self, allowed: bool) -> Self {
        self.duplicate_allowed = allowed;
        self
    }
}

//! Message envelope returned by a mail provider's unread listing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Provider-native message id.
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub cc: String,
    #[serde(default)]
    pub bcc: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Render the envelope as the user message handed to a director.
    pub fn render_for_prompt(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("From: {}\n", self.from));
        if !self.to.is_empty() {
            out.push_str(&format!("To: {}\n", self.to));
        }
        if !self.cc.is_empty() {
            out.push_str(&format!("Cc: {}\n", self.cc));
        }
        out.push_str(&format!("Subject: {}\n", self.subject));
        if let Some(date) = self.date {
            out.push_str(&format!("Date: {}\n", date.to_rfc3339()));
        }
        out.push('\n');
        if self.body.is_empty() {
            out.push_str(&self.snippet);
        } else {
            out.push_str(&self.body);
        }
        out
    }
}

//! Conversation threads and their state machine.
//!
//! `ongoing → finalized` is terminal. Independently a thread expires once
//! `now ≥ last_active_at + ttl`. Finalized and expired threads reject every
//! mutation; both checks run before any change is applied.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConversationError;
use crate::llm::ChatMessage;
use crate::model::envelope::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadKind {
    Director,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Ongoing,
    Finalized,
}

/// A persisted director or agent transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationThread {
    pub id: String,
    pub kind: ThreadKind,
    /// Director thread that delegated to this agent thread.
    #[serde(default)]
    pub parent_id: Option<String>,
    pub director_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    /// Triggering email, for director threads.
    #[serde(default)]
    pub email: Option<Envelope>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub status: ThreadStatus,
    #[serde(default)]
    pub finalized: bool,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConversationThread {
    /// New director thread seeded with `messages`.
    pub fn new_director(
        director_id: impl Into<String>,
        trace_id: Option<String>,
        email: Option<Envelope>,
        messages: Vec<ChatMessage>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: ThreadKind::Director,
            parent_id: None,
            director_id: director_id.into(),
            agent_id: None,
            trace_id,
            email,
            messages,
            status: ThreadStatus::Ongoing,
            finalized: false,
            started_at: now,
            last_active_at: now,
            expires_at: now + ttl,
        }
    }

    /// New agent thread delegated from `parent`.
    pub fn new_agent(
        parent: &ConversationThread,
        agent_id: impl Into<String>,
        messages: Vec<ChatMessage>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: ThreadKind::Agent,
            parent_id: Some(parent.id.clone()),
            director_id: parent.director_id.clone(),
            agent_id: Some(agent_id.into()),
            trace_id: parent.trace_id.clone(),
            email: None,
            messages,
            status: ThreadStatus::Ongoing,
            finalized: false,
            started_at: now,
            last_active_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized || self.status == ThreadStatus::Finalized
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Reject mutation of finalized or expired threads.
    pub fn ensure_writable(&self, now: DateTime<Utc>) -> Result<(), ConversationError> {
        if self.is_finalized() {
            return Err(ConversationError::Finalized {
                id: self.id.clone(),
            });
        }
        if self.is_expired(now) {
            return Err(ConversationError::Expired {
                id: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Append a message and slide the expiry window forward.
    pub fn append(
        &mut self,
        message: ChatMessage,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), ConversationError> {
        self.ensure_writable(now)?;
        self.messages.push(message);
        self.touch(now, ttl);
        Ok(())
    }

    /// Append several messages atomically: all or none.
    pub fn append_all(
        &mut self,
        messages: impl IntoIterator<Item = ChatMessage>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), ConversationError> {
        self.ensure_writable(now)?;
        self.messages.extend(messages);
        self.touch(now, ttl);
        Ok(())
    }

    /// Move to the terminal `finalized` state. Finalizing twice is a no-op.
    pub fn finalize(&mut self, now: DateTime<Utc>) {
        if self.is_finalized() {
            return;
        }
        self.status = ThreadStatus::Finalized;
        self.finalized = true;
        self.last_active_at = now;
    }

    /// Whether this is an agent thread delegation may continue.
    pub fn is_reusable_for(&self, parent_id: &str, agent_id: &str, now: DateTime<Utc>) -> bool {
        self.kind == ThreadKind::Agent
            && self.parent_id.as_deref() == Some(parent_id)
            && self.agent_id.as_deref() == Some(agent_id)
            && self.status == ThreadStatus::Ongoing
            && !self.finalized
            && !self.is_expired(now)
    }

    fn touch(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.last_active_at = now;
        self.expires_at = now + ttl;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ttl() -> Duration {
        Duration::minutes(30)
    }

    fn director_thread(now: DateTime<Utc>) -> ConversationThread {
        ConversationThread::new_director(
            "d1",
            None,
            None,
            vec![ChatMessage::system("triage")],
            now,
            ttl(),
        )
    }

    #[test]
    fn append_extends_expiry() {
        let now = Utc::now();
        let mut thread = director_thread(now);
        let later = now + Duration::minutes(20);
        thread.append(ChatMessage::user("hi"), later, ttl()).unwrap();
        assert_eq!(thread.messages.len(), 2);
        assert_eq!(thread.last_active_at, later);
        assert_eq!(thread.expires_at, later + ttl());
    }

    #[test]
    fn finalized_thread_rejects_appends() {
        let now = Utc::now();
        let mut thread = director_thread(now);
        thread.finalize(now);
        assert!(thread.is_finalized());
        let err = thread.append(ChatMessage::user("more"), now, ttl()).unwrap_err();
        assert!(matches!(err, ConversationError::Finalized { .. }));
        assert_eq!(thread.messages.len(), 1);
    }

    #[test]
    fn expired_thread_rejects_appends() {
        let now = Utc::now();
        let mut thread = director_thread(now);
        let err = thread
            .append(ChatMessage::user("late"), now + Duration::minutes(31), ttl())
            .unwrap_err();
        assert!(matches!(err, ConversationError::Expired { .. }));
    }

    #[test]
    fn finalized_is_checked_before_expiry() {
        let now = Utc::now();
        let mut thread = director_thread(now);
        thread.finalize(now);
        let err = thread.ensure_writable(now + Duration::days(1)).unwrap_err();
        assert!(matches!(err, ConversationError::Finalized { .. }));
    }

    #[test]
    fn reusable_only_while_ongoing() {
        let now = Utc::now();
        let parent = director_thread(now);
        let mut agent = ConversationThread::new_agent(&parent, "a1", vec![], now, ttl());
        assert!(agent.is_reusable_for(&parent.id, "a1", now));
        assert!(!agent.is_reusable_for(&parent.id, "a2", now));
        assert!(!agent.is_reusable_for("other", "a1", now));
        assert!(!agent.is_reusable_for(&parent.id, "a1", now + Duration::hours(1)));
        agent.finalize(now);
        assert!(!agent.is_reusable_for(&parent.id, "a1", now));
    }
}

//! Conversation thread persistence.
//!
//! Every read-modify-write of the conversations collection holds the
//! bundle's conversation writer lock, so concurrent steps in one process
//! never lose each other's appends. The lock is never held across an LLM
//! or tool call.

use chrono::{DateTime, Duration, Utc};

use crate::error::{ConversationError, EngineError};
use crate::llm::ChatMessage;
use crate::model::ConversationThread;
use crate::tenant::TenantContext;

pub async fn get(ctx: &TenantContext, id: &str) -> Result<ConversationThread, EngineError> {
    ctx.bundle
        .conversations
        .get_all()
        .await?
        .into_iter()
        .find(|t| t.id == id)
        .ok_or_else(|| ConversationError::NotFound { id: id.to_string() }.into())
}

pub async fn insert(ctx: &TenantContext, thread: ConversationThread) -> Result<(), EngineError> {
    let _guard = ctx.bundle.lock_conversations().await;
    ctx.bundle
        .conversations
        .update(move |threads| threads.push(thread))
        .await?;
    Ok(())
}

/// Apply `f` to the stored thread and write it back. Nothing is written
/// when `f` fails.
async fn modify<F>(ctx: &TenantContext, id: &str, f: F) -> Result<ConversationThread, EngineError>
where
    F: FnOnce(&mut ConversationThread) -> Result<(), ConversationError>,
{
    let _guard = ctx.bundle.lock_conversations().await;
    let mut threads = ctx.bundle.conversations.get_all().await?;
    let thread = threads
        .iter_mut()
        .find(|t| t.id == id)
        .ok_or_else(|| ConversationError::NotFound { id: id.to_string() })?;
    f(thread)?;
    let updated = thread.clone();
    ctx.bundle.conversations.set_all(&threads).await?;
    Ok(updated)
}

pub async fn append(
    ctx: &TenantContext,
    id: &str,
    messages: Vec<ChatMessage>,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<ConversationThread, EngineError> {
    modify(ctx, id, |thread| thread.append_all(messages, now, ttl)).await
}

pub async fn finalize(
    ctx: &TenantContext,
    id: &str,
    now: DateTime<Utc>,
) -> Result<ConversationThread, EngineError> {
    modify(ctx, id, |thread| {
        thread.finalize(now);
        Ok(())
    })
    .await
}

/// Reuse the ongoing agent thread for `(parent, agent_id)` by appending
/// `instruction`, or create a new one seeded with `system_prompt`. Returns
/// the thread and whether it was reused.
pub async fn open_agent_thread(
    ctx: &TenantContext,
    parent: &ConversationThread,
    agent_id: &str,
    system_prompt: &str,
    instruction: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<(ConversationThread, bool), EngineError> {
    let _guard = ctx.bundle.lock_conversations().await;
    let mut threads = ctx.bundle.conversations.get_all().await?;

    if let Some(existing) = threads
        .iter_mut()
        .find(|t| t.is_reusable_for(&parent.id, agent_id, now))
    {
        existing.append(ChatMessage::user(instruction), now, ttl)?;
        let reused = existing.clone();
        ctx.bundle.conversations.set_all(&threads).await?;
        return Ok((reused, true));
    }

    let thread = ConversationThread::new_agent(
        parent,
        agent_id,
        vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user(instruction),
        ],
        now,
        ttl,
    );
    threads.push(thread.clone());
    ctx.bundle.conversations.set_all(&threads).await?;
    Ok((thread, false))
}

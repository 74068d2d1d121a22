//! External collaborators consumed by the connection manager.
//!
//! The conversation store, role directory and message persistence live
//! outside this crate; the manager only talks to them through these traits.
//! [`InMemoryDirectory`] implements all three for standalone runs and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use switchboard_core::protocol::{ConversationSummary, NewMessage};
use switchboard_core::{Identity, Role};

use crate::errors::DirectoryError;

/// Conversation list and unread counts per identity.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Conversations visible to `identity`.
    async fn conversations_for(
        &self,
        identity: &Identity,
    ) -> Result<Vec<ConversationSummary>, DirectoryError>;

    /// Unread count per conversation id for `identity`.
    async fn unread_counts(&self, identity: &Identity)
    -> Result<HashMap<String, u64>, DirectoryError>;
}

/// Role lookup for credentials that carry no role.
#[async_trait]
pub trait RoleDirectory: Send + Sync {
    /// Role of `user_id`, if known.
    async fn role_of(&self, user_id: &str) -> Result<Option<Role>, DirectoryError>;
}

/// Receives `new-message` events once auth and rate limiting cleared them.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Accept (persist, forward) a message from `sender`.
    async fn accept(&self, sender: &Identity, message: &NewMessage) -> Result<(), DirectoryError>;
}

/// The three collaborators, as handed to the manager.
#[derive(Clone)]
pub struct Collaborators {
    /// Conversation list / unread counts.
    pub conversations: Arc<dyn ConversationStore>,
    /// Role fallback.
    pub roles: Arc<dyn RoleDirectory>,
    /// Message persistence.
    pub messages: Arc<dyn MessageSink>,
}

impl Collaborators {
    /// Use one directory for all three roles.
    pub fn from_directory<D>(directory: Arc<D>) -> Self
    where
        D: ConversationStore + RoleDirectory + MessageSink + 'static,
    {
        Self {
            conversations: directory.clone(),
            roles: directory.clone(),
            messages: directory,
        }
    }
}

/// In-process directory keyed by user id.
#[derive(Default)]
pub struct InMemoryDirectory {
    conversations: RwLock<HashMap<String, Vec<ConversationSummary>>>,
    unread: RwLock<HashMap<String, HashMap<String, u64>>>,
    roles: RwLock<HashMap<String, Role>>,
    accepted: RwLock<Vec<(String, NewMessage)>>,
    reject_messages: RwLock<Option<String>>,
}

impl InMemoryDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the conversation list for `user_id`.
    pub fn set_conversations(&self, user_id: &str, conversations: Vec<ConversationSummary>) {
        let _ = self
            .conversations
            .write()
            .insert(user_id.to_owned(), conversations);
    }

    /// Set one unread count for `user_id`.
    pub fn set_unread(&self, user_id: &str, conversation_id: &str, count: u64) {
        let _ = self
            .unread
            .write()
            .entry(user_id.to_owned())
            .or_default()
            .insert(conversation_id.to_owned(), count);
    }

    /// Record the role for `user_id`.
    pub fn set_role(&self, user_id: &str, role: Role) {
        let _ = self.roles.write().insert(user_id.to_owned(), role);
    }

    /// Refuse every subsequent message with `reason` (`None` to accept again).
    pub fn reject_messages(&self, reason: Option<&str>) {
        *self.reject_messages.write() = reason.map(str::to_owned);
    }

    /// Messages accepted so far, as `(sender user id, message)`.
    pub fn accepted_messages(&self) -> Vec<(String, NewMessage)> {
        self.accepted.read().clone()
    }
}

#[async_trait]
impl ConversationStore for InMemoryDirectory {
    async fn conversations_for(
        &self,
        identity: &Identity,
    ) -> Result<Vec<ConversationSummary>, DirectoryError> {
        Ok(self
            .conversations
            .read()
            .get(&identity.user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn unread_counts(
        &self,
        identity: &Identity,
    ) -> Result<HashMap<String, u64>, DirectoryError> {
        Ok(self
            .unread
            .read()
            .get(&identity.user_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl RoleDirectory for InMemoryDirectory {
    async fn role_of(&self, user_id: &str) -> Result<Option<Role>, DirectoryError> {
        Ok(self.roles.read().get(user_id).copied())
    }
}

#[async_trait]
impl MessageSink for InMemoryDirectory {
    async fn accept(&self, sender: &Identity, message: &NewMessage) -> Result<(), DirectoryError> {
        if let Some(reason) = self.reject_messages.read().clone() {
            return Err(DirectoryError::Rejected(reason));
        }
        self.accepted
            .write()
            .push((sender.user_id.clone(), message.clone()));
        Ok(())
    }
}

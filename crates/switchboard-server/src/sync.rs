//! State Sync Responder.
//!
//! Builds a `state-synced` snapshot for one identity. Collaborators are
//! awaited first and the registry is read last, so presence in the snapshot
//! is never older than the registry at the moment the response is built.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use switchboard_core::Identity;
use switchboard_core::protocol::{StateSnapshot, rfc3339_millis};
use tracing::debug;

use crate::directory::ConversationStore;
use crate::errors::EventError;
use crate::registry::ResourceRegistry;

/// Prefix of ids generated for the automatic post-authentication sync.
pub const INITIAL_PREFIX: &str = "initial_";
/// Prefix of ids generated for a `sync-state` without `syncId`.
pub const REQUESTED_PREFIX: &str = "sync_";

/// Why a snapshot is being built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOrigin {
    /// Sent automatically right after authentication.
    Initial,
    /// Asked for by the client.
    Requested,
}

impl SyncOrigin {
    fn prefix(self) -> &'static str {
        match self {
            Self::Initial => INITIAL_PREFIX,
            Self::Requested => REQUESTED_PREFIX,
        }
    }
}

/// Generate a correlation id: `<prefix><unix millis>`.
pub fn generate_sync_id(origin: SyncOrigin, at: DateTime<Utc>) -> String {
    format!("{}{}", origin.prefix(), at.timestamp_millis())
}

/// Parse a generated correlation id back into its origin and timestamp.
///
/// Returns `None` for caller-supplied ids.
pub fn parse_sync_id(sync_id: &str) -> Option<(SyncOrigin, DateTime<Utc>)> {
    let (origin, millis) = if let Some(rest) = sync_id.strip_prefix(INITIAL_PREFIX) {
        (SyncOrigin::Initial, rest)
    } else if let Some(rest) = sync_id.strip_prefix(REQUESTED_PREFIX) {
        (SyncOrigin::Requested, rest)
    } else {
        return None;
    };
    let millis: i64 = millis.parse().ok()?;
    DateTime::from_timestamp_millis(millis).map(|at| (origin, at))
}

/// Answers `sync-state` requests.
pub struct SyncResponder {
    registry: Arc<ResourceRegistry>,
    conversations: Arc<dyn ConversationStore>,
}

impl SyncResponder {
    /// Responder reading `conversations` and `registry`.
    pub fn new(registry: Arc<ResourceRegistry>, conversations: Arc<dyn ConversationStore>) -> Self {
        Self {
            registry,
            conversations,
        }
    }

    /// Build a snapshot for `identity`.
    ///
    /// A supplied `sync_id` is echoed verbatim; otherwise one is generated
    /// from `origin` and the current time.
    pub async fn snapshot(
        &self,
        identity: &Identity,
        sync_id: Option<String>,
        origin: SyncOrigin,
    ) -> Result<StateSnapshot, EventError> {
        let sync_id = sync_id.unwrap_or_else(|| generate_sync_id(origin, Utc::now()));

        let (conversations, unread_counts) = tokio::try_join!(
            self.conversations.conversations_for(identity),
            self.conversations.unread_counts(identity),
        )
        .map_err(|e| EventError::SyncFailed(e.to_string()))?;

        let online_users = self.registry.online_users();
        debug!(
            user_id = %identity.user_id,
            sync_id,
            conversations = conversations.len(),
            online = online_users.len(),
            "built state snapshot"
        );

        Ok(StateSnapshot {
            conversations,
            unread_counts,
            online_users,
            server_time: rfc3339_millis(Utc::now()),
            sync_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use switchboard_core::protocol::ConversationSummary;
    use switchboard_core::{ConnectionId, Role};
    use tokio::sync::mpsc;

    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::errors::DirectoryError;
    use crate::websocket::connection::ClientConnection;

    fn identity(user: &str) -> Identity {
        Identity::new(user, None, Role::Agent, Utc::now())
    }

    fn online(reg: &ResourceRegistry, user: &str) -> Arc<ClientConnection> {
        let (tx, _rx) = mpsc::channel(4);
        let conn = Arc::new(ClientConnection::new(ConnectionId::new(), tx));
        reg.attach(conn.clone());
        let _ = reg.register(&conn, identity(user)).unwrap();
        conn
    }

    struct Unavailable;

    #[async_trait]
    impl ConversationStore for Unavailable {
        async fn conversations_for(
            &self,
            _identity: &Identity,
        ) -> Result<Vec<ConversationSummary>, DirectoryError> {
            Err(DirectoryError::Unavailable("store down".into()))
        }

        async fn unread_counts(
            &self,
            _identity: &Identity,
        ) -> Result<HashMap<String, u64>, DirectoryError> {
            Ok(HashMap::new())
        }
    }

    #[test]
    fn generated_ids_parse_back() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let id = generate_sync_id(SyncOrigin::Initial, at);
        assert_eq!(id, "initial_1700000000123");
        assert_eq!(parse_sync_id(&id), Some((SyncOrigin::Initial, at)));
        assert_eq!(parse_sync_id("client-42"), None);
        assert_eq!(parse_sync_id("sync_notanumber"), None);
    }

    #[tokio::test]
    async fn supplied_sync_id_is_echoed() {
        let reg = Arc::new(ResourceRegistry::new());
        let responder = SyncResponder::new(reg, Arc::new(InMemoryDirectory::new()));
        let snap = responder
            .snapshot(&identity("u1"), Some("X".into()), SyncOrigin::Requested)
            .await
            .unwrap();
        assert_eq!(snap.sync_id, "X");
    }

    #[tokio::test]
    async fn missing_sync_id_is_generated() {
        let reg = Arc::new(ResourceRegistry::new());
        let responder = SyncResponder::new(reg, Arc::new(InMemoryDirectory::new()));
        let snap = responder
            .snapshot(&identity("u1"), None, SyncOrigin::Initial)
            .await
            .unwrap();
        assert!(snap.sync_id.starts_with("initial_"));
        assert_matches::assert_matches!(parse_sync_id(&snap.sync_id), Some((SyncOrigin::Initial, _)));
    }

    #[tokio::test]
    async fn snapshot_reads_collaborators_and_presence() {
        let reg = Arc::new(ResourceRegistry::new());
        let dir = Arc::new(InMemoryDirectory::new());
        dir.set_conversations(
            "u1",
            vec![ConversationSummary {
                id: "c1".into(),
                title: None,
                updated_at: None,
            }],
        );
        dir.set_unread("u1", "c1", 2);
        let responder = SyncResponder::new(reg.clone(), dir);

        let _a = online(&reg, "u1");
        let b = online(&reg, "u2");

        let snap = responder
            .snapshot(&identity("u1"), None, SyncOrigin::Requested)
            .await
            .unwrap();
        assert_eq!(snap.conversations.len(), 1);
        assert_eq!(snap.unread_counts["c1"], 2);
        assert_eq!(snap.online_users, vec!["u1", "u2"]);

        let _ = reg.release(&b.id);
        let snap = responder
            .snapshot(&identity("u1"), None, SyncOrigin::Requested)
            .await
            .unwrap();
        assert_eq!(snap.online_users, vec!["u1"]);
    }

    #[tokio::test]
    async fn collaborator_failure_is_sync_failed() {
        let reg = Arc::new(ResourceRegistry::new());
        let responder = SyncResponder::new(reg, Arc::new(Unavailable));
        let err = responder
            .snapshot(&identity("u1"), None, SyncOrigin::Requested)
            .await
            .unwrap_err();
        assert_matches::assert_matches!(err, EventError::SyncFailed(_));
    }
}

//! Owner-scoped conversation and message persistence.
//!
//! The pipeline consumes the store through the [`ConversationStore`] trait:
//! a small CRUD surface where every operation is parameterized by the
//! caller's owner id, so no operation can return or mutate another owner's
//! data. Messages are immutable once written; the only mutations are insert
//! and delete, and deleting a conversation cascades to its messages.
//!
//! Two implementations:
//!
//! - [`FsStore`]: JSON directories, one per owner, one per conversation,
//!   written atomically via a temp file and rename.
//! - [`MemoryStore`]: mutex-guarded maps for tests and ephemeral runs.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::MessageRole;
use crate::error::StoreError;

// ── Records ────────────────────────────────────────────────────────

/// A titled, owned sequence of turns.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One immutable turn of a conversation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub owner_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for a message insert. The id is caller-supplied so the
/// pipeline can generate reply identifiers independently of the provider.
#[derive(Debug)]
pub struct NewMessage<'a> {
    pub id: &'a str,
    pub role: MessageRole,
    pub content: &'a str,
    pub owner_id: &'a str,
    pub conversation_id: &'a str,
}

// ── Trait ──────────────────────────────────────────────────────────

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// The persistence contract the pipeline consumes.
///
/// All operations are implicitly scoped to `owner_id`; implementations must
/// treat an id belonging to another owner as absent.
pub trait ConversationStore: Send + Sync {
    /// All of an owner's conversations, most recently updated first.
    fn list_conversations<'a>(&'a self, owner_id: &'a str) -> StoreFuture<'a, Vec<Conversation>>;

    /// Create a conversation with a fresh id.
    fn create_conversation<'a>(
        &'a self,
        owner_id: &'a str,
        title: &'a str,
    ) -> StoreFuture<'a, Conversation>;

    /// Delete a conversation and every message in it.
    fn delete_conversation<'a>(
        &'a self,
        owner_id: &'a str,
        conversation_id: &'a str,
    ) -> StoreFuture<'a, ()>;

    /// One conversation's turns in creation order (oldest first).
    fn history<'a>(
        &'a self,
        owner_id: &'a str,
        conversation_id: &'a str,
    ) -> StoreFuture<'a, Vec<StoredMessage>>;

    /// The most recent turn, if any.
    fn latest<'a>(
        &'a self,
        owner_id: &'a str,
        conversation_id: &'a str,
    ) -> StoreFuture<'a, Option<StoredMessage>>;

    /// Append one immutable message.
    fn insert_message<'a>(&'a self, message: NewMessage<'a>) -> StoreFuture<'a, StoredMessage>;

    /// Delete one message by id within the owner's scope.
    fn delete_message<'a>(&'a self, owner_id: &'a str, message_id: &'a str)
    -> StoreFuture<'a, ()>;
}

/// Identifiers become path components in [`FsStore`], so anything that
/// could escape the owner's directory is rejected outright.
fn validate_id(id: &str) -> Result<(), StoreError> {
    let ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '@' || c == '.');
    if ok && !id.starts_with('.') {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

// ── Filesystem store ───────────────────────────────────────────────

/// JSON-on-disk store.
///
/// Directory layout:
/// ```text
/// root/
///   <owner-id>/
///     <conversation-id>/
///       conversation.json
///       messages.json
/// ```
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Create a store, ensuring the root directory exists.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn owner_dir(&self, owner_id: &str) -> PathBuf {
        self.root.join(owner_id)
    }

    fn conversation_dir(&self, owner_id: &str, conversation_id: &str) -> PathBuf {
        self.owner_dir(owner_id).join(conversation_id)
    }

    /// Atomic write: serialize to a temp file, then rename into place.
    fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, StoreError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    fn load_conversation(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation, StoreError> {
        let path = self
            .conversation_dir(owner_id, conversation_id)
            .join("conversation.json");
        if !path.exists() {
            return Err(StoreError::NotFound(conversation_id.to_string()));
        }
        Self::read_json(&path)
    }

    fn load_messages(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let path = self
            .conversation_dir(owner_id, conversation_id)
            .join("messages.json");
        if !path.exists() {
            return Err(StoreError::NotFound(conversation_id.to_string()));
        }
        let mut messages: Vec<StoredMessage> = Self::read_json(&path)?;
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    fn save_messages(
        &self,
        owner_id: &str,
        conversation_id: &str,
        messages: &[StoredMessage],
    ) -> Result<(), StoreError> {
        let path = self
            .conversation_dir(owner_id, conversation_id)
            .join("messages.json");
        Self::write_json(&path, &messages)
    }

    fn touch_conversation(&self, owner_id: &str, conversation_id: &str) -> Result<(), StoreError> {
        let mut conversation = self.load_conversation(owner_id, conversation_id)?;
        conversation.updated_at = Utc::now();
        let path = self
            .conversation_dir(owner_id, conversation_id)
            .join("conversation.json");
        Self::write_json(&path, &conversation)
    }
}

impl ConversationStore for FsStore {
    fn list_conversations<'a>(&'a self, owner_id: &'a str) -> StoreFuture<'a, Vec<Conversation>> {
        Box::pin(async move {
            validate_id(owner_id)?;
            let dir = self.owner_dir(owner_id);
            if !dir.exists() {
                return Ok(vec![]);
            }
            let mut conversations = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path().join("conversation.json");
                if !path.exists() {
                    continue;
                }
                match Self::read_json::<Conversation>(&path) {
                    Ok(c) => conversations.push(c),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable conversation"),
                }
            }
            conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(conversations)
        })
    }

    fn create_conversation<'a>(
        &'a self,
        owner_id: &'a str,
        title: &'a str,
    ) -> StoreFuture<'a, Conversation> {
        Box::pin(async move {
            validate_id(owner_id)?;
            let now = Utc::now();
            let conversation = Conversation {
                id: Uuid::new_v4().to_string(),
                title: title.to_string(),
                owner_id: owner_id.to_string(),
                created_at: now,
                updated_at: now,
            };
            let dir = self.conversation_dir(owner_id, &conversation.id);
            std::fs::create_dir_all(&dir)?;
            Self::write_json(&dir.join("conversation.json"), &conversation)?;
            Self::write_json(&dir.join("messages.json"), &Vec::<StoredMessage>::new())?;
            Ok(conversation)
        })
    }

    fn delete_conversation<'a>(
        &'a self,
        owner_id: &'a str,
        conversation_id: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            validate_id(owner_id)?;
            validate_id(conversation_id)?;
            let dir = self.conversation_dir(owner_id, conversation_id);
            if !dir.exists() {
                return Err(StoreError::NotFound(conversation_id.to_string()));
            }
            // Removing the directory cascades to the conversation's messages.
            std::fs::remove_dir_all(&dir)?;
            Ok(())
        })
    }

    fn history<'a>(
        &'a self,
        owner_id: &'a str,
        conversation_id: &'a str,
    ) -> StoreFuture<'a, Vec<StoredMessage>> {
        Box::pin(async move {
            validate_id(owner_id)?;
            validate_id(conversation_id)?;
            self.load_messages(owner_id, conversation_id)
        })
    }

    fn latest<'a>(
        &'a self,
        owner_id: &'a str,
        conversation_id: &'a str,
    ) -> StoreFuture<'a, Option<StoredMessage>> {
        Box::pin(async move {
            validate_id(owner_id)?;
            validate_id(conversation_id)?;
            Ok(self.load_messages(owner_id, conversation_id)?.pop())
        })
    }

    fn insert_message<'a>(&'a self, message: NewMessage<'a>) -> StoreFuture<'a, StoredMessage> {
        Box::pin(async move {
            validate_id(message.owner_id)?;
            validate_id(message.conversation_id)?;
            validate_id(message.id)?;
            // Insert requires the conversation to exist within the owner's scope.
            self.load_conversation(message.owner_id, message.conversation_id)?;

            let now = Utc::now();
            let stored = StoredMessage {
                id: message.id.to_string(),
                conversation_id: message.conversation_id.to_string(),
                owner_id: message.owner_id.to_string(),
                role: message.role,
                content: message.content.to_string(),
                created_at: now,
                updated_at: now,
            };

            let mut messages = self.load_messages(message.owner_id, message.conversation_id)?;
            messages.push(stored.clone());
            self.save_messages(message.owner_id, message.conversation_id, &messages)?;
            self.touch_conversation(message.owner_id, message.conversation_id)?;
            Ok(stored)
        })
    }

    fn delete_message<'a>(
        &'a self,
        owner_id: &'a str,
        message_id: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            validate_id(owner_id)?;
            validate_id(message_id)?;
            for conversation in self.list_conversations(owner_id).await? {
                let mut messages = self.load_messages(owner_id, &conversation.id)?;
                if let Some(pos) = messages.iter().position(|m| m.id == message_id) {
                    messages.remove(pos);
                    self.save_messages(owner_id, &conversation.id, &messages)?;
                    return Ok(());
                }
            }
            Err(StoreError::NotFound(message_id.to_string()))
        })
    }
}

// ── In-memory store ────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    /// Keyed by (owner id, conversation id).
    conversations: HashMap<(String, String), Conversation>,
    messages: HashMap<(String, String), Vec<StoredMessage>>,
}

/// Mutex-guarded in-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ConversationStore for MemoryStore {
    fn list_conversations<'a>(&'a self, owner_id: &'a str) -> StoreFuture<'a, Vec<Conversation>> {
        Box::pin(async move {
            let inner = self.lock();
            let mut conversations: Vec<Conversation> = inner
                .conversations
                .values()
                .filter(|c| c.owner_id == owner_id)
                .cloned()
                .collect();
            conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(conversations)
        })
    }

    fn create_conversation<'a>(
        &'a self,
        owner_id: &'a str,
        title: &'a str,
    ) -> StoreFuture<'a, Conversation> {
        Box::pin(async move {
            let now = Utc::now();
            let conversation = Conversation {
                id: Uuid::new_v4().to_string(),
                title: title.to_string(),
                owner_id: owner_id.to_string(),
                created_at: now,
                updated_at: now,
            };
            let key = (owner_id.to_string(), conversation.id.clone());
            let mut inner = self.lock();
            inner.conversations.insert(key.clone(), conversation.clone());
            inner.messages.insert(key, Vec::new());
            Ok(conversation)
        })
    }

    fn delete_conversation<'a>(
        &'a self,
        owner_id: &'a str,
        conversation_id: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let key = (owner_id.to_string(), conversation_id.to_string());
            let mut inner = self.lock();
            if inner.conversations.remove(&key).is_none() {
                return Err(StoreError::NotFound(conversation_id.to_string()));
            }
            inner.messages.remove(&key);
            Ok(())
        })
    }

    fn history<'a>(
        &'a self,
        owner_id: &'a str,
        conversation_id: &'a str,
    ) -> StoreFuture<'a, Vec<StoredMessage>> {
        Box::pin(async move {
            let key = (owner_id.to_string(), conversation_id.to_string());
            let inner = self.lock();
            inner
                .messages
                .get(&key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))
        })
    }

    fn latest<'a>(
        &'a self,
        owner_id: &'a str,
        conversation_id: &'a str,
    ) -> StoreFuture<'a, Option<StoredMessage>> {
        Box::pin(async move { Ok(self.history(owner_id, conversation_id).await?.pop()) })
    }

    fn insert_message<'a>(&'a self, message: NewMessage<'a>) -> StoreFuture<'a, StoredMessage> {
        Box::pin(async move {
            let key = (
                message.owner_id.to_string(),
                message.conversation_id.to_string(),
            );
            let now = Utc::now();
            let stored = StoredMessage {
                id: message.id.to_string(),
                conversation_id: message.conversation_id.to_string(),
                owner_id: message.owner_id.to_string(),
                role: message.role,
                content: message.content.to_string(),
                created_at: now,
                updated_at: now,
            };
            let mut inner = self.lock();
            let Some(conversation) = inner.conversations.get_mut(&key) else {
                return Err(StoreError::NotFound(message.conversation_id.to_string()));
            };
            conversation.updated_at = now;
            inner
                .messages
                .get_mut(&key)
                .ok_or_else(|| StoreError::NotFound(message.conversation_id.to_string()))?
                .push(stored.clone());
            Ok(stored)
        })
    }

    fn delete_message<'a>(
        &'a self,
        owner_id: &'a str,
        message_id: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.lock();
            for ((owner, _), messages) in inner.messages.iter_mut() {
                if owner != owner_id {
                    continue;
                }
                if let Some(pos) = messages.iter().position(|m| m.id == message_id) {
                    messages.remove(pos);
                    return Ok(());
                }
            }
            Err(StoreError::NotFound(message_id.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded(store: &dyn ConversationStore) -> Conversation {
        let conversation = store.create_conversation("owner-1", "First chat").await.unwrap();
        store
            .insert_message(NewMessage {
                id: "msg-1",
                role: MessageRole::User,
                content: "Hi",
                owner_id: "owner-1",
                conversation_id: &conversation.id,
            })
            .await
            .unwrap();
        conversation
    }

    #[tokio::test]
    async fn fs_store_round_trips_a_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        let conversation = seeded(&store).await;

        let listed = store.list_conversations("owner-1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "First chat");

        let history = store.history("owner-1", &conversation.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "Hi");
        assert_eq!(history[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn fs_store_latest_returns_newest_message() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        let conversation = seeded(&store).await;
        store
            .insert_message(NewMessage {
                id: "msg-2",
                role: MessageRole::Assistant,
                content: "Hello!",
                owner_id: "owner-1",
                conversation_id: &conversation.id,
            })
            .await
            .unwrap();

        let latest = store.latest("owner-1", &conversation.id).await.unwrap();
        assert_eq!(latest.unwrap().id, "msg-2");
    }

    #[tokio::test]
    async fn fs_store_delete_cascades_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        let conversation = seeded(&store).await;

        store
            .delete_conversation("owner-1", &conversation.id)
            .await
            .unwrap();
        assert!(store.list_conversations("owner-1").await.unwrap().is_empty());
        let err = store.history("owner-1", &conversation.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn fs_store_scopes_by_owner() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        let conversation = seeded(&store).await;

        // Another owner sees nothing and cannot read or delete.
        assert!(store.list_conversations("owner-2").await.unwrap().is_empty());
        assert!(store.history("owner-2", &conversation.id).await.is_err());
        assert!(
            store
                .delete_conversation("owner-2", &conversation.id)
                .await
                .is_err()
        );
        // The real owner is unaffected.
        assert_eq!(store.list_conversations("owner-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fs_store_rejects_traversal_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        let err = store.history("../evil", "conv").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidId(_)));
    }

    #[tokio::test]
    async fn memory_store_matches_contract() {
        let store = MemoryStore::new();
        let conversation = seeded(&store).await;

        let history = store.history("owner-1", &conversation.id).await.unwrap();
        assert_eq!(history.len(), 1);

        store.delete_message("owner-1", "msg-1").await.unwrap();
        assert!(store.history("owner-1", &conversation.id).await.unwrap().is_empty());

        store
            .delete_conversation("owner-1", &conversation.id)
            .await
            .unwrap();
        assert!(store.history("owner-1", &conversation.id).await.is_err());
    }

    #[tokio::test]
    async fn insert_into_missing_conversation_fails() {
        let store = MemoryStore::new();
        let err = store
            .insert_message(NewMessage {
                id: "msg-1",
                role: MessageRole::User,
                content: "Hi",
                owner_id: "owner-1",
                conversation_id: "nope",
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}

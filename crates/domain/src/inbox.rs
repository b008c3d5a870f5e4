use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::DomainResult;
use crate::chat::{
    Chat, ChatSettings, ChatType, DIRECT_CHAT_SEPARATOR, ParticipantInfo, backfill_participants,
};
use crate::documents::{self, Identified, chat_path, inbox_collection, inbox_path};
use crate::error::DomainError;
use crate::identity::IdentitySession;
use crate::ports::BoxStream;
use crate::ports::store::{DocumentStore, FieldPath, Query, StoreError, Transaction, Write};

/// Per-user bookkeeping for one chat membership.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InboxEntry {
    #[serde(default)]
    pub chat_id: String,
    #[serde(default, rename = "lastReadAt")]
    pub last_read_at_ms: Option<i64>,
    #[serde(default)]
    pub unread_count: i64,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default, rename = "joinedAt")]
    pub joined_at_ms: i64,
}

impl Identified for InboxEntry {
    fn assign_id(&mut self, id: &str) {
        if self.chat_id.is_empty() {
            self.chat_id = id.to_string();
        }
    }
}

impl InboxEntry {
    fn new(chat_id: &str, unread_count: i64) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            unread_count,
            ..Self::default()
        }
    }

    pub fn unread(&self) -> i64 {
        self.unread_count.max(0)
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub chat: Chat,
    pub entry: InboxEntry,
    pub display_name: String,
    pub counterpart: Option<ParticipantInfo>,
    pub last_activity_ms: i64,
}

/// Outcome of checking one chat's participant list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatRepair {
    Ok(Chat),
    Reconstructed(Chat),
    Unrecoverable(String),
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub reconstructed: Vec<String>,
    pub unrecoverable: Vec<String>,
    /// Entries whose chat document no longer exists. They are left in place.
    pub missing_chats: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct InboxRepair {
    pub created: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Clone)]
pub struct InboxService {
    store: Arc<dyn DocumentStore>,
    settings: ChatSettings,
}

impl InboxService {
    pub fn new(store: Arc<dyn DocumentStore>, settings: ChatSettings) -> Self {
        Self {
            store,
            settings: settings.normalized(),
        }
    }

    pub async fn reconcile(&self, user_id: &str) -> DomainResult<ReconcileReport> {
        let entries = self.entries(user_id).await?;
        let mut report = ReconcileReport::default();
        for entry in entries {
            report.checked += 1;
            match self.inspect(&entry.chat_id).await? {
                None => report.missing_chats.push(entry.chat_id),
                Some(ChatRepair::Ok(_)) => {}
                Some(ChatRepair::Reconstructed(chat)) => report.reconstructed.push(chat.chat_id),
                Some(ChatRepair::Unrecoverable(chat_id)) => report.unrecoverable.push(chat_id),
            }
        }
        if !report.unrecoverable.is_empty() {
            tracing::warn!(
                user_id,
                chats = ?report.unrecoverable,
                "chats without recoverable participants"
            );
        }
        Ok(report)
    }

    /// Loads a chat and heals its participant list when it can be derived from the id.
    /// Returns `None` when the chat document does not exist.
    pub async fn inspect(&self, chat_id: &str) -> DomainResult<Option<ChatRepair>> {
        let Some(mut chat) =
            documents::load::<Chat>(self.store.as_ref(), &chat_path(chat_id)).await?
        else {
            return Ok(None);
        };

        let derived = if chat.chat_type == ChatType::Direct {
            reconstruct_participants(chat_id, self.settings.min_user_id_len)
        } else {
            Vec::new()
        };
        let missing_derived = derived
            .iter()
            .any(|user_id| !chat.has_participant(user_id));

        if chat.is_usable() && !missing_derived {
            return Ok(Some(ChatRepair::Ok(chat)));
        }
        if derived.is_empty() {
            return Ok(Some(ChatRepair::Unrecoverable(chat_id.to_string())));
        }

        for user_id in derived {
            if !chat.has_participant(&user_id) {
                chat.participants.push(user_id);
            }
        }
        if !chat.is_usable() {
            return Ok(Some(ChatRepair::Unrecoverable(chat_id.to_string())));
        }
        backfill_participants(
            self.store.as_ref(),
            &mut chat.participants_info,
            &chat.participants,
        )
        .await;

        let receipt = self
            .store
            .commit(Transaction::new().require_exists(chat_path(chat_id)).write(
                Write::update(
                    chat_path(chat_id),
                    vec![
                        (FieldPath::new("participants"), json!(chat.participants)),
                        (
                            FieldPath::new("participantsInfo"),
                            serde_json::to_value(&chat.participants_info)
                                .map_err(|err| StoreError::Serialization(err.to_string()))?,
                        ),
                    ],
                )
                .with_server_timestamp("updatedAt"),
            ))
            .await?;
        chat.updated_at_ms = receipt.commit_time_ms;

        let repair = ensure_entries(self.store.as_ref(), chat_id, &chat.participants).await;
        tracing::info!(
            chat_id,
            participants = ?chat.participants,
            created_entries = repair.created.len(),
            "reconstructed chat participants from id"
        );
        Ok(Some(ChatRepair::Reconstructed(chat)))
    }

    /// Runs [`Self::inspect`] on behalf of a member. Membership is checked against the
    /// stored participants, or the ids embedded in a direct chat's id, before anything
    /// is written.
    pub async fn repair(&self, actor: &IdentitySession, chat_id: &str) -> DomainResult<ChatRepair> {
        let chat = documents::load::<Chat>(self.store.as_ref(), &chat_path(chat_id))
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("chat {chat_id}")))?;
        let embedded = chat.chat_type == ChatType::Direct
            && reconstruct_participants(chat_id, self.settings.min_user_id_len)
                .iter()
                .any(|user_id| *user_id == actor.user_id);
        if !chat.has_participant(&actor.user_id) && !embedded {
            return Err(DomainError::Unauthorized(
                "not a participant of this chat".into(),
            ));
        }
        self.inspect(chat_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("chat {chat_id}")))
    }

    /// Pinned first, then most recent activity. Missing, hidden and unrecoverable chats
    /// are left out.
    pub async fn list_conversations(&self, user_id: &str) -> DomainResult<Vec<ConversationSummary>> {
        let entries = self.entries(user_id).await?;
        Ok(self.summarize(user_id, entries).await)
    }

    pub async fn subscribe_to_user_chats(
        &self,
        user_id: &str,
    ) -> DomainResult<BoxStream<Vec<ConversationSummary>>> {
        let snapshots = self
            .store
            .subscribe(&Query::collection(inbox_collection(user_id)))
            .await?;
        let service = self.clone();
        let user_id = user_id.to_string();
        Ok(Box::pin(snapshots.then(move |documents| {
            let service = service.clone();
            let user_id = user_id.clone();
            async move {
                service
                    .summarize(&user_id, documents::decode_all(documents))
                    .await
            }
        })))
    }

    pub async fn set_pinned(
        &self,
        actor: &IdentitySession,
        chat_id: &str,
        pinned: bool,
    ) -> DomainResult<InboxEntry> {
        self.set_flag(actor, chat_id, "isPinned", pinned).await
    }

    pub async fn set_archived(
        &self,
        actor: &IdentitySession,
        chat_id: &str,
        archived: bool,
    ) -> DomainResult<InboxEntry> {
        self.set_flag(actor, chat_id, "isArchived", archived).await
    }

    pub async fn total_unread(&self, user_id: &str) -> DomainResult<i64> {
        Ok(self
            .entries(user_id)
            .await?
            .iter()
            .map(InboxEntry::unread)
            .sum())
    }

    async fn entries(&self, user_id: &str) -> DomainResult<Vec<InboxEntry>> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(DomainError::InvalidArgument("user_id is required".into()));
        }
        let documents = self
            .store
            .query(&Query::collection(inbox_collection(user_id)))
            .await?;
        Ok(documents::decode_all(documents))
    }

    async fn summarize(&self, user_id: &str, entries: Vec<InboxEntry>) -> Vec<ConversationSummary> {
        let mut summaries = Vec::with_capacity(entries.len());
        for entry in entries {
            let chat = match self.inspect(&entry.chat_id).await {
                Ok(Some(ChatRepair::Ok(chat) | ChatRepair::Reconstructed(chat))) => chat,
                Ok(Some(ChatRepair::Unrecoverable(chat_id))) => {
                    tracing::warn!(user_id, chat_id = %chat_id, "skipping chat without participants");
                    continue;
                }
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(user_id, chat_id = %entry.chat_id, error = %err, "chat lookup failed");
                    continue;
                }
            };
            if !chat.is_active || !chat.has_participant(user_id) {
                continue;
            }
            summaries.push(summarize_chat(user_id, chat, entry));
        }
        summaries.sort_by(|a, b| {
            b.entry
                .is_pinned
                .cmp(&a.entry.is_pinned)
                .then(b.last_activity_ms.cmp(&a.last_activity_ms))
                .then_with(|| a.chat.chat_id.cmp(&b.chat.chat_id))
        });
        summaries
    }

    async fn set_flag(
        &self,
        actor: &IdentitySession,
        chat_id: &str,
        field: &str,
        value: bool,
    ) -> DomainResult<InboxEntry> {
        let path = inbox_path(&actor.user_id, chat_id);
        let mut entry: InboxEntry = documents::load(self.store.as_ref(), &path)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("inbox entry for chat {chat_id}")))?;
        self.store
            .commit(
                Transaction::new()
                    .require_exists(path.clone())
                    .write(Write::update(path, vec![(FieldPath::new(field), json!(value))])),
            )
            .await?;
        match field {
            "isPinned" => entry.is_pinned = value,
            _ => entry.is_archived = value,
        }
        Ok(entry)
    }
}

fn summarize_chat(user_id: &str, chat: Chat, entry: InboxEntry) -> ConversationSummary {
    let counterpart = match chat.chat_type {
        ChatType::Direct => chat
            .participants
            .iter()
            .find(|participant| *participant != user_id)
            .map(|participant| {
                chat.participants_info
                    .get(participant)
                    .cloned()
                    .unwrap_or_else(ParticipantInfo::unknown)
            }),
        ChatType::Group => None,
    };
    let display_name = match (&chat.metadata, &counterpart) {
        (Some(metadata), _) if chat.chat_type == ChatType::Group => metadata.name.clone(),
        (_, Some(info)) => info.name.clone(),
        _ => crate::chat::UNKNOWN_USER_NAME.to_string(),
    };
    ConversationSummary {
        last_activity_ms: chat.last_activity_ms(),
        display_name,
        counterpart,
        chat,
        entry,
    }
}

/// Splits a direct chat id into the tokens that look like user ids.
pub fn reconstruct_participants(chat_id: &str, min_user_id_len: usize) -> Vec<String> {
    let tokens: Vec<String> = chat_id
        .split(DIRECT_CHAT_SEPARATOR)
        .map(str::trim)
        .filter(|token| token.chars().count() >= min_user_id_len)
        .map(str::to_string)
        .collect();
    if tokens.len() == 2 && tokens[0] != tokens[1] {
        tokens
    } else {
        Vec::new()
    }
}

pub(crate) fn entry_write(user_id: &str, chat_id: &str) -> DomainResult<Write> {
    Ok(Write::set(inbox_path(user_id, chat_id), &InboxEntry::new(chat_id, 0))?
        .with_server_timestamp("joinedAt"))
}

/// Creates the entry only when absent; an entry written concurrently counts as present.
async fn create_entry(
    store: &dyn DocumentStore,
    user_id: &str,
    chat_id: &str,
    unread_count: i64,
) -> Result<bool, StoreError> {
    let path = inbox_path(user_id, chat_id);
    let write = Write::set(path.clone(), &InboxEntry::new(chat_id, unread_count))?
        .with_server_timestamp("joinedAt");
    match store
        .commit(Transaction::new().require_missing(path).write(write))
        .await
    {
        Ok(_) => Ok(true),
        Err(StoreError::PreconditionFailed(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Best-effort: every participant gets an entry, failures are reported instead of raised.
pub(crate) async fn ensure_entries(
    store: &dyn DocumentStore,
    chat_id: &str,
    participants: &[String],
) -> InboxRepair {
    let mut repair = InboxRepair::default();
    for user_id in participants {
        let exists = store.get(&inbox_path(user_id, chat_id)).await;
        let outcome = match exists {
            Ok(Some(_)) => continue,
            Ok(None) => create_entry(store, user_id, chat_id, 0).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(true) => repair.created.push(user_id.clone()),
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(chat_id, user_id = %user_id, error = %err, "inbox entry repair failed");
                repair.failed.push(user_id.clone());
            }
        }
    }
    repair
}

/// Atomic `+1` on the recipient's unread counter, creating the entry when it is absent.
pub(crate) async fn increment_unread(
    store: &dyn DocumentStore,
    user_id: &str,
    chat_id: &str,
) -> Result<(), StoreError> {
    let path = inbox_path(user_id, chat_id);
    let increment = || {
        Transaction::new()
            .require_exists(path.clone())
            .write(Write::increment(path.clone(), "unreadCount", 1))
    };
    match store.commit(increment()).await {
        Ok(_) => Ok(()),
        Err(StoreError::PreconditionFailed(_)) => {
            if create_entry(store, user_id, chat_id, 1).await? {
                Ok(())
            } else {
                store.commit(increment()).await.map(|_| ())
            }
        }
        Err(err) => Err(err),
    }
}

pub(crate) async fn reset_unread(
    store: &dyn DocumentStore,
    user_id: &str,
    chat_id: &str,
) -> DomainResult<()> {
    let path = inbox_path(user_id, chat_id);
    let reset = Transaction::new().require_exists(path.clone()).write(
        Write::update(path, vec![(FieldPath::new("unreadCount"), json!(0))])
            .with_server_timestamp("lastReadAt"),
    );
    match store.commit(reset).await {
        Ok(_) => Ok(()),
        Err(StoreError::PreconditionFailed(_)) => {
            create_entry(store, user_id, chat_id, 0).await?;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

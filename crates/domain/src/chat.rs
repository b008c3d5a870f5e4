use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};

use crate::DomainResult;
use crate::documents::{self, Identified, chat_path, message_path, messages_collection};
use crate::error::DomainError;
use crate::identity::IdentitySession;
use crate::inbox::{self, InboxRepair};
use crate::ports::BoxStream;
use crate::ports::store::{
    DocumentStore, FieldPath, FilterOp, MAX_BATCH_WRITES, Query, StoreError, Transaction, Write,
};
use crate::profiles::{lookup_participant_info, participant_info};

const MAX_TEXT_LENGTH: usize = 2_000;
const MAX_GROUP_NAME_LENGTH: usize = 100;
const MAX_GROUP_DESCRIPTION_LENGTH: usize = 500;
const MAX_GROUP_MEMBERS: usize = 256;
const MAX_MESSAGES_PER_PAGE: usize = 200;
const DEFAULT_MESSAGES_PER_PAGE: usize = 50;
/// Upper bound on messages stamped by one read.
pub const MAX_READ_RECEIPT_WINDOW: usize = 50;

pub const DIRECT_CHAT_SEPARATOR: char = '_';
pub const UNKNOWN_USER_NAME: &str = "Unknown User";

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    #[default]
    Direct,
    Group,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupRole {
    Admin,
    Member,
}

/// Denormalized display snapshot of a participant.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<GroupRole>,
}

impl ParticipantInfo {
    pub fn unknown() -> Self {
        Self {
            name: UNKNOWN_USER_NAME.to_string(),
            username: "unknown".to_string(),
            avatar: None,
            role: None,
        }
    }

    pub fn with_role(mut self, role: Option<GroupRole>) -> Self {
        self.role = role;
        self
    }

    /// Placeholder or blank snapshots are refreshed whenever a chat is repaired.
    pub fn is_complete(&self) -> bool {
        !self.name.trim().is_empty() && self.name != UNKNOWN_USER_NAME
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    System,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, rename = "createdAt")]
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    #[serde(default)]
    pub chat_id: String,
    #[serde(rename = "type", default)]
    pub chat_type: ChatType,
    #[serde(default, deserialize_with = "lenient_participants")]
    pub participants: Vec<String>,
    #[serde(default)]
    pub participants_info: BTreeMap<String, ParticipantInfo>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default, rename = "createdAt")]
    pub created_at_ms: i64,
    #[serde(default, rename = "updatedAt")]
    pub updated_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<GroupMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl Identified for Chat {
    fn assign_id(&mut self, id: &str) {
        if self.chat_id.is_empty() {
            self.chat_id = id.to_string();
        }
    }
}

impl Chat {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|participant| participant == user_id)
    }

    /// A chat needs at least two participants to be rendered or written to.
    pub fn is_usable(&self) -> bool {
        self.participants.len() >= 2
    }

    pub fn role_of(&self, user_id: &str) -> Option<GroupRole> {
        self.participants_info
            .get(user_id)
            .and_then(|info| info.role)
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_message
            .as_ref()
            .map(|message| message.created_at_ms)
            .unwrap_or(self.updated_at_ms)
            .max(self.created_at_ms)
    }

    fn add_missing_participants(&mut self, required: &[&str]) -> bool {
        let mut changed = false;
        for user_id in required {
            if !self.has_participant(user_id) {
                self.participants.push((*user_id).to_string());
                changed = true;
            }
        }
        changed
    }
}

fn default_active() -> bool {
    true
}

/// Accepts absent, null or sparse participant arrays as written by older clients.
fn lenient_participants<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<Option<String>>> = Option::deserialize(deserializer)?;
    let mut seen = HashSet::new();
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .flatten()
        .map(|participant| participant.trim().to_string())
        .filter(|participant| !participant.is_empty() && seen.insert(participant.clone()))
        .collect())
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub chat_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, rename = "createdAt")]
    pub created_at_ms: i64,
    #[serde(default)]
    pub read_by: BTreeMap<String, i64>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default, rename = "editedAt")]
    pub edited_at_ms: Option<i64>,
}

impl Identified for Message {
    fn assign_id(&mut self, id: &str) {
        if self.message_id.is_empty() {
            self.message_id = id.to_string();
        }
    }
}

impl Message {
    fn preview(&self) -> LastMessage {
        LastMessage {
            message_id: Some(self.message_id.clone()),
            text: self.text.clone(),
            sender_id: self.sender_id.clone(),
            message_type: self.message_type,
            created_at_ms: self.created_at_ms,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct MessageContent {
    pub text: String,
    pub image_url: Option<String>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image_url: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct GroupChatCreate {
    pub name: String,
    pub description: String,
    pub avatar: Option<String>,
    pub member_ids: Vec<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub next_before_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ReadReceipt {
    pub chat_id: String,
    pub user_id: String,
    pub stamped_messages: usize,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct DeletionReport {
    pub chat_id: String,
    pub messages_deleted: usize,
    pub inbox_entries_deleted: usize,
}

/// Result of [`ChatService::open_direct_chat`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum DirectChatOpen {
    Created { chat: Chat, commit_time_ms: i64 },
    Existing(Chat),
    GuardFailed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatSettings {
    /// How many of the newest messages get a read stamp per read.
    pub read_receipt_window: usize,
    pub delete_batch_size: usize,
    /// Minimum token length accepted as a user id when rebuilding participants from a chat id.
    pub min_user_id_len: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            read_receipt_window: MAX_READ_RECEIPT_WINDOW,
            delete_batch_size: 400,
            min_user_id_len: 8,
        }
    }
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.read_receipt_window = self.read_receipt_window.clamp(1, MAX_READ_RECEIPT_WINDOW);
        self.delete_batch_size = self.delete_batch_size.clamp(1, MAX_BATCH_WRITES);
        self.min_user_id_len = self.min_user_id_len.max(1);
        self
    }
}

/// Deterministic id of the direct chat between two users.
pub fn direct_chat_id(user_a: &str, user_b: &str) -> String {
    let mut pair = [user_a, user_b];
    pair.sort_unstable();
    format!("{}{DIRECT_CHAT_SEPARATOR}{}", pair[0], pair[1])
}

#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn DocumentStore>,
    settings: ChatSettings,
}

impl ChatService {
    pub fn new(store: Arc<dyn DocumentStore>, settings: ChatSettings) -> Self {
        Self {
            store,
            settings: settings.normalized(),
        }
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub async fn create_direct_chat(&self, user_a: &str, user_b: &str) -> DomainResult<Chat> {
        let (user_a, user_b) = validate_pair(user_a, user_b)?;
        match self.open_direct_chat(user_a, user_b, Transaction::new()).await? {
            DirectChatOpen::Created { chat, .. } => Ok(chat),
            DirectChatOpen::Existing(chat) => self.repair_chat(chat, &[user_a, user_b]).await,
            // An empty guard has no preconditions of its own.
            DirectChatOpen::GuardFailed => Err(DomainError::TransactionFailed(format!(
                "chat {} could not be created",
                direct_chat_id(user_a, user_b)
            ))),
        }
    }

    /// Writes a new direct chat together with `guard` in one commit, so the room only
    /// appears when every precondition of `guard` holds. An existing room is returned
    /// untouched and `guard` is left for the caller to commit.
    pub(crate) async fn open_direct_chat(
        &self,
        user_a: &str,
        user_b: &str,
        guard: Transaction,
    ) -> DomainResult<DirectChatOpen> {
        let (user_a, user_b) = validate_pair(user_a, user_b)?;
        let chat_id = direct_chat_id(user_a, user_b);

        if let Some(existing) = self.load_chat(&chat_id).await? {
            return Ok(DirectChatOpen::Existing(existing));
        }

        let mut participants = vec![user_a.to_string(), user_b.to_string()];
        participants.sort();
        let mut participants_info = BTreeMap::new();
        for user_id in &participants {
            participants_info.insert(
                user_id.clone(),
                participant_info(self.store.as_ref(), user_id).await,
            );
        }

        let mut chat = Chat {
            chat_id: chat_id.clone(),
            chat_type: ChatType::Direct,
            participants,
            participants_info,
            is_active: true,
            last_message: None,
            created_at_ms: 0,
            updated_at_ms: 0,
            metadata: None,
            created_by: None,
        };

        let path = chat_path(&chat_id);
        let mut transaction = guard.require_missing(path.clone()).write(
            Write::set(path, &chat)?
                .with_server_timestamp("createdAt")
                .with_server_timestamp("updatedAt"),
        );
        for user_id in &chat.participants {
            transaction = transaction.write(inbox::entry_write(user_id, &chat_id)?);
        }

        match self.store.commit(transaction).await {
            Ok(receipt) => {
                chat.created_at_ms = receipt.commit_time_ms;
                chat.updated_at_ms = receipt.commit_time_ms;
                tracing::info!(chat_id = %chat_id, "direct chat created");
                Ok(DirectChatOpen::Created {
                    chat,
                    commit_time_ms: receipt.commit_time_ms,
                })
            }
            Err(StoreError::PreconditionFailed(_)) => match self.load_chat(&chat_id).await? {
                Some(existing) => {
                    // Lost a creation race; the winner's document is authoritative.
                    tracing::debug!(chat_id = %chat_id, "direct chat created concurrently");
                    Ok(DirectChatOpen::Existing(existing))
                }
                None => Ok(DirectChatOpen::GuardFailed),
            },
            Err(err) => Err(err.into()),
        }
    }

    pub async fn create_group_chat(
        &self,
        actor: &IdentitySession,
        input: GroupChatCreate,
    ) -> DomainResult<Chat> {
        let input = validate_group_create(&actor.user_id, input)?;
        let chat_id = crate::util::random_id();

        let mut participants_info = BTreeMap::new();
        for user_id in &input.member_ids {
            let role = if *user_id == actor.user_id {
                GroupRole::Admin
            } else {
                GroupRole::Member
            };
            let info = participant_info(self.store.as_ref(), user_id)
                .await
                .with_role(Some(role));
            participants_info.insert(user_id.clone(), info);
        }

        let mut chat = Chat {
            chat_id: chat_id.clone(),
            chat_type: ChatType::Group,
            participants: input.member_ids,
            participants_info,
            is_active: true,
            last_message: None,
            created_at_ms: 0,
            updated_at_ms: 0,
            metadata: Some(GroupMetadata {
                name: input.name,
                description: input.description,
                avatar: input.avatar,
            }),
            created_by: Some(actor.user_id.clone()),
        };

        let chat_write = Write::set(chat_path(&chat_id), &chat)?
            .with_server_timestamp("createdAt")
            .with_server_timestamp("updatedAt");
        let mut transaction = Transaction::new()
            .require_missing(chat_path(&chat_id))
            .write(chat_write.clone());
        for user_id in &chat.participants {
            transaction = transaction.write(inbox::entry_write(user_id, &chat_id)?);
        }

        let receipt = match self.store.commit(transaction).await {
            Ok(receipt) => receipt,
            Err(err) => {
                tracing::warn!(
                    chat_id = %chat_id,
                    error = %err,
                    "group chat transaction failed; writing room and repairing inbox entries"
                );
                let receipt = self
                    .store
                    .commit(Transaction::new().write(chat_write))
                    .await?;
                let repair =
                    inbox::ensure_entries(self.store.as_ref(), &chat_id, &chat.participants).await;
                if !repair.failed.is_empty() {
                    tracing::warn!(
                        chat_id = %chat_id,
                        failed = ?repair.failed,
                        "group chat created with missing inbox entries"
                    );
                }
                receipt
            }
        };

        chat.created_at_ms = receipt.commit_time_ms;
        chat.updated_at_ms = receipt.commit_time_ms;
        tracing::info!(
            chat_id = %chat_id,
            members = chat.participants.len(),
            "group chat created"
        );
        Ok(chat)
    }

    /// Makes sure both users are participants with display info and inbox entries.
    /// A missing chat is created only when `chat_id` is the pair's direct chat id.
    pub async fn ensure_chat_participants(
        &self,
        chat_id: &str,
        user_a: &str,
        user_b: &str,
    ) -> DomainResult<Chat> {
        let (user_a, user_b) = validate_pair(user_a, user_b)?;
        match self.load_chat(chat_id).await? {
            Some(chat) => self.repair_chat(chat, &[user_a, user_b]).await,
            None if chat_id == direct_chat_id(user_a, user_b) => {
                self.create_direct_chat(user_a, user_b).await
            }
            None => Err(DomainError::InvalidArgument(format!(
                "chat {chat_id} is not the direct chat of {user_a} and {user_b}"
            ))),
        }
    }

    pub async fn ensure_user_chat_entries(&self, chat_id: &str) -> DomainResult<InboxRepair> {
        let chat = self.require_chat(chat_id).await?;
        Ok(inbox::ensure_entries(self.store.as_ref(), chat_id, &chat.participants).await)
    }

    pub async fn check_existing_chat(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> DomainResult<Option<Chat>> {
        let (user_a, user_b) = validate_pair(user_a, user_b)?;
        self.load_chat(&direct_chat_id(user_a, user_b)).await
    }

    pub async fn get_chat(&self, actor: &IdentitySession, chat_id: &str) -> DomainResult<Chat> {
        let chat = self.require_chat(chat_id).await?;
        ensure_participant(&chat, &actor.user_id)?;
        Ok(chat)
    }

    pub async fn send_message(
        &self,
        actor: &IdentitySession,
        chat_id: &str,
        content: MessageContent,
    ) -> DomainResult<Message> {
        let content = validate_message_content(content)?;
        let chat = self.require_chat(chat_id).await?;
        if !chat.is_active {
            return Err(DomainError::NotFound(format!("chat {chat_id} is not active")));
        }
        ensure_participant(&chat, &actor.user_id)?;

        let message_type = if content.image_url.is_some() {
            MessageType::Image
        } else {
            MessageType::Text
        };
        let mut message = Message {
            message_id: crate::util::uuid_v7_without_dashes(),
            chat_id: chat_id.to_string(),
            sender_id: actor.user_id.clone(),
            text: content.text,
            image_url: content.image_url,
            message_type,
            created_at_ms: 0,
            read_by: BTreeMap::new(),
            edited: false,
            edited_at_ms: None,
        };

        let preview = encode(&message.preview())?;
        let path = message_path(chat_id, &message.message_id);
        let receipt = self
            .store
            .commit(
                Transaction::new()
                    .require_exists(chat_path(chat_id))
                    .require_missing(path.clone())
                    .write(Write::set(path, &message)?.with_server_timestamp("createdAt"))
                    .write(
                        Write::update(
                            chat_path(chat_id),
                            vec![(FieldPath::new("lastMessage"), preview)],
                        )
                        .with_server_timestamp(FieldPath::new("lastMessage").child("createdAt"))
                        .with_server_timestamp("updatedAt"),
                    ),
            )
            .await?;
        message.created_at_ms = receipt.commit_time_ms;

        for recipient in chat
            .participants
            .iter()
            .filter(|participant| **participant != actor.user_id)
        {
            if let Err(err) =
                inbox::increment_unread(self.store.as_ref(), recipient, chat_id).await
            {
                tracing::warn!(
                    chat_id = %chat_id,
                    user_id = %recipient,
                    error = %err,
                    "unread count update failed"
                );
            }
        }

        tracing::debug!(chat_id = %chat_id, message_id = %message.message_id, "message sent");
        Ok(message)
    }

    pub async fn fetch_messages(
        &self,
        actor: &IdentitySession,
        chat_id: &str,
        before_ms: Option<i64>,
        limit: Option<usize>,
    ) -> DomainResult<MessagePage> {
        let chat = self.require_chat(chat_id).await?;
        ensure_participant(&chat, &actor.user_id)?;

        let limit = limit
            .unwrap_or(DEFAULT_MESSAGES_PER_PAGE)
            .clamp(1, MAX_MESSAGES_PER_PAGE);
        let mut query = Query::collection(messages_collection(chat_id))
            .order_by_desc("createdAt")
            .limit(limit);
        if let Some(before_ms) = before_ms {
            query = query.filter("createdAt", FilterOp::Lt, json!(before_ms));
        }

        let mut messages: Vec<Message> = documents::decode_all(self.store.query(&query).await?);
        messages.reverse();
        Ok(build_message_page(messages, limit))
    }

    /// Live, ascending view of the newest messages in a chat.
    pub async fn subscribe_to_messages(
        &self,
        actor: &IdentitySession,
        chat_id: &str,
        limit: Option<usize>,
    ) -> DomainResult<BoxStream<Vec<Message>>> {
        let chat = self.require_chat(chat_id).await?;
        ensure_participant(&chat, &actor.user_id)?;

        let limit = limit
            .unwrap_or(DEFAULT_MESSAGES_PER_PAGE)
            .clamp(1, MAX_MESSAGES_PER_PAGE);
        let query = Query::collection(messages_collection(chat_id))
            .order_by_desc("createdAt")
            .limit(limit);
        let snapshots = self.store.subscribe(&query).await?;
        Ok(Box::pin(snapshots.map(|documents| {
            let mut messages: Vec<Message> = documents::decode_all(documents);
            messages.reverse();
            messages
        })))
    }

    pub async fn edit_message(
        &self,
        actor: &IdentitySession,
        chat_id: &str,
        message_id: &str,
        text: &str,
    ) -> DomainResult<Message> {
        let chat = self.require_chat(chat_id).await?;
        ensure_participant(&chat, &actor.user_id)?;

        let path = message_path(chat_id, message_id);
        let mut message: Message = documents::load(self.store.as_ref(), &path)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("message {message_id}")))?;
        if message.sender_id != actor.user_id {
            return Err(DomainError::Unauthorized(
                "only the sender can edit a message".into(),
            ));
        }
        if message.message_type == MessageType::System {
            return Err(DomainError::InvalidArgument(
                "system messages cannot be edited".into(),
            ));
        }
        let text = text.trim().to_string();
        if text.is_empty() && message.image_url.is_none() {
            return Err(DomainError::InvalidArgument("message text is required".into()));
        }
        if text.chars().count() > MAX_TEXT_LENGTH {
            return Err(DomainError::InvalidArgument(format!(
                "message exceeds max length of {MAX_TEXT_LENGTH}"
            )));
        }

        let mut transaction = Transaction::new().write(
            Write::update(
                path.clone(),
                vec![
                    (FieldPath::new("text"), json!(text)),
                    (FieldPath::new("edited"), json!(true)),
                ],
            )
            .with_server_timestamp("editedAt"),
        );
        let is_latest = chat
            .last_message
            .as_ref()
            .and_then(|last| last.message_id.as_deref())
            == Some(message_id);
        if is_latest {
            transaction = transaction.write(Write::update(
                chat_path(chat_id),
                vec![(FieldPath::new("lastMessage").child("text"), json!(text))],
            ));
        }
        let receipt = self
            .store
            .commit(transaction.require_exists(path))
            .await?;

        message.text = text;
        message.edited = true;
        message.edited_at_ms = Some(receipt.commit_time_ms);
        Ok(message)
    }

    pub async fn mark_messages_as_read(
        &self,
        actor: &IdentitySession,
        chat_id: &str,
    ) -> DomainResult<ReadReceipt> {
        let chat = self.require_chat(chat_id).await?;
        ensure_participant(&chat, &actor.user_id)?;

        inbox::reset_unread(self.store.as_ref(), &actor.user_id, chat_id).await?;

        let recent = self
            .store
            .query(
                &Query::collection(messages_collection(chat_id))
                    .order_by_desc("createdAt")
                    .limit(self.settings.read_receipt_window),
            )
            .await?;
        let stamp_field = FieldPath::new("readBy").child(actor.user_id.as_str());
        let writes: Vec<Write> = documents::decode_all::<Message>(recent)
            .into_iter()
            .filter(|message| {
                message.sender_id != actor.user_id && !message.read_by.contains_key(&actor.user_id)
            })
            .map(|message| {
                Write::update(message_path(chat_id, &message.message_id), Vec::new())
                    .with_server_timestamp(stamp_field.clone())
            })
            .collect();

        let stamped_messages = writes.len();
        if !writes.is_empty() {
            self.store.batch_write(writes).await?;
        }

        Ok(ReadReceipt {
            chat_id: chat_id.to_string(),
            user_id: actor.user_id.clone(),
            stamped_messages,
        })
    }

    /// Removes every message, every participant's inbox entry and finally the chat.
    ///
    /// Messages are deleted page by page from whatever remains, so an interrupted
    /// run can simply be invoked again.
    pub async fn delete_chat_permanently(
        &self,
        actor: &IdentitySession,
        chat_id: &str,
    ) -> DomainResult<DeletionReport> {
        let chat = self.require_chat(chat_id).await?;
        let mut participants = chat.participants.clone();
        if !chat.is_usable() {
            for user_id in inbox::reconstruct_participants(chat_id, self.settings.min_user_id_len)
            {
                if !participants.contains(&user_id) {
                    participants.push(user_id);
                }
            }
        }
        if !participants.contains(&actor.user_id) {
            return Err(DomainError::Unauthorized(format!(
                "not a participant of chat {chat_id}"
            )));
        }

        let mut report = DeletionReport {
            chat_id: chat_id.to_string(),
            ..DeletionReport::default()
        };
        let page = Query::collection(messages_collection(chat_id)).limit(self.settings.delete_batch_size);
        loop {
            let batch = self.store.query(&page).await?;
            if batch.is_empty() {
                break;
            }
            let count = batch.len();
            let writes = batch
                .into_iter()
                .map(|document| Write::delete(document.path))
                .collect();
            self.store.batch_write(writes).await?;
            report.messages_deleted += count;
            tracing::debug!(chat_id = %chat_id, deleted = count, "deleted message page");
        }

        for chunk in participants.chunks(self.settings.delete_batch_size) {
            let writes = chunk
                .iter()
                .map(|user_id| Write::delete(documents::inbox_path(user_id, chat_id)))
                .collect();
            self.store.batch_write(writes).await?;
            report.inbox_entries_deleted += chunk.len();
        }

        self.store
            .commit(Transaction::new().write(Write::delete(chat_path(chat_id))))
            .await?;

        tracing::info!(
            chat_id = %chat_id,
            messages = report.messages_deleted,
            entries = report.inbox_entries_deleted,
            "chat deleted permanently"
        );
        Ok(report)
    }

    /// Soft hide/unhide; hidden chats drop out of conversation lists and reject new messages.
    pub async fn set_chat_active(
        &self,
        actor: &IdentitySession,
        chat_id: &str,
        active: bool,
    ) -> DomainResult<Chat> {
        let mut chat = self.require_chat(chat_id).await?;
        ensure_participant(&chat, &actor.user_id)?;

        let receipt = self
            .store
            .commit(Transaction::new().require_exists(chat_path(chat_id)).write(
                Write::update(chat_path(chat_id), vec![(FieldPath::new("isActive"), json!(active))])
                    .with_server_timestamp("updatedAt"),
            ))
            .await?;
        chat.is_active = active;
        chat.updated_at_ms = receipt.commit_time_ms;
        Ok(chat)
    }

    pub async fn add_group_members(
        &self,
        actor: &IdentitySession,
        chat_id: &str,
        member_ids: Vec<String>,
    ) -> DomainResult<Chat> {
        let mut chat = self.require_chat(chat_id).await?;
        if chat.chat_type != ChatType::Group {
            return Err(DomainError::InvalidArgument(
                "members can only be added to group chats".into(),
            ));
        }
        ensure_participant(&chat, &actor.user_id)?;
        if chat.role_of(&actor.user_id) != Some(GroupRole::Admin) {
            return Err(DomainError::Unauthorized(
                "only group admins can add members".into(),
            ));
        }

        let added: Vec<String> = dedupe_ids(member_ids)
            .into_iter()
            .filter(|user_id| !chat.has_participant(user_id))
            .collect();
        if added.is_empty() {
            return Ok(chat);
        }
        if chat.participants.len() + added.len() > MAX_GROUP_MEMBERS {
            return Err(DomainError::InvalidArgument(format!(
                "groups are limited to {MAX_GROUP_MEMBERS} members"
            )));
        }

        for user_id in &added {
            let info = participant_info(self.store.as_ref(), user_id)
                .await
                .with_role(Some(GroupRole::Member));
            chat.participants.push(user_id.clone());
            chat.participants_info.insert(user_id.clone(), info);
        }

        let receipt = self.write_membership(&chat).await?;
        chat.updated_at_ms = receipt;
        let repair = inbox::ensure_entries(self.store.as_ref(), chat_id, &added).await;
        if !repair.failed.is_empty() {
            return Err(DomainError::TransactionFailed(format!(
                "inbox entries missing for {}",
                repair.failed.join(", ")
            )));
        }
        tracing::info!(chat_id = %chat_id, added = added.len(), "group members added");
        Ok(chat)
    }

    pub async fn leave_group(&self, actor: &IdentitySession, chat_id: &str) -> DomainResult<Chat> {
        let mut chat = self.require_chat(chat_id).await?;
        if chat.chat_type != ChatType::Group {
            return Err(DomainError::InvalidArgument(
                "direct chats cannot be left".into(),
            ));
        }
        ensure_participant(&chat, &actor.user_id)?;

        chat.participants.retain(|participant| *participant != actor.user_id);
        chat.participants_info.remove(&actor.user_id);

        let has_admin = chat
            .participants
            .iter()
            .any(|participant| chat.role_of(participant) == Some(GroupRole::Admin));
        if !has_admin {
            // Participants are kept in join order, so the first one is the oldest member.
            if let Some(successor) = chat.participants.first().cloned() {
                chat.participants_info
                    .entry(successor.clone())
                    .or_insert_with(ParticipantInfo::unknown)
                    .role = Some(GroupRole::Admin);
                tracing::info!(chat_id = %chat_id, user_id = %successor, "promoted to group admin");
            }
        }
        if chat.participants.is_empty() {
            chat.is_active = false;
        }

        let receipt = self
            .store
            .commit(
                Transaction::new()
                    .require_exists(chat_path(chat_id))
                    .write(membership_write(&chat)?)
                    .write(Write::delete(documents::inbox_path(&actor.user_id, chat_id))),
            )
            .await?;
        chat.updated_at_ms = receipt.commit_time_ms;
        Ok(chat)
    }

    pub(crate) async fn load_chat(&self, chat_id: &str) -> DomainResult<Option<Chat>> {
        documents::load(self.store.as_ref(), &chat_path(chat_id)).await
    }

    async fn require_chat(&self, chat_id: &str) -> DomainResult<Chat> {
        let chat_id = chat_id.trim();
        if chat_id.is_empty() {
            return Err(DomainError::InvalidArgument("chat_id is required".into()));
        }
        self.load_chat(chat_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("chat {chat_id}")))
    }

    /// Unions `required` into the participants, refreshes incomplete display info and
    /// re-creates any missing inbox entry.
    async fn repair_chat(&self, mut chat: Chat, required: &[&str]) -> DomainResult<Chat> {
        let members_changed = chat.add_missing_participants(required);
        let info_changed = backfill_participants(
            self.store.as_ref(),
            &mut chat.participants_info,
            &chat.participants,
        )
        .await;

        if members_changed || info_changed {
            chat.updated_at_ms = self.write_membership(&chat).await?;
            tracing::info!(
                chat_id = %chat.chat_id,
                members_changed,
                info_changed,
                "chat participants repaired"
            );
        }

        let repair =
            inbox::ensure_entries(self.store.as_ref(), &chat.chat_id, &chat.participants).await;
        if !repair.failed.is_empty() {
            return Err(DomainError::TransactionFailed(format!(
                "inbox entries missing for {}",
                repair.failed.join(", ")
            )));
        }
        Ok(chat)
    }

    async fn write_membership(&self, chat: &Chat) -> DomainResult<i64> {
        let receipt = self
            .store
            .commit(
                Transaction::new()
                    .require_exists(chat_path(&chat.chat_id))
                    .write(membership_write(chat)?),
            )
            .await?;
        Ok(receipt.commit_time_ms)
    }
}

fn membership_write(chat: &Chat) -> DomainResult<Write> {
    Ok(Write::update(
        chat_path(&chat.chat_id),
        vec![
            (FieldPath::new("participants"), encode(&chat.participants)?),
            (
                FieldPath::new("participantsInfo"),
                encode(&chat.participants_info)?,
            ),
            (FieldPath::new("isActive"), json!(chat.is_active)),
        ],
    )
    .with_server_timestamp("updatedAt"))
}

/// Fills missing or placeholder display info from profiles, keeping group roles.
/// Returns whether anything changed.
pub(crate) async fn backfill_participants(
    store: &dyn DocumentStore,
    info: &mut BTreeMap<String, ParticipantInfo>,
    participants: &[String],
) -> bool {
    let mut changed = false;
    for user_id in participants {
        let (missing, role) = match info.get(user_id) {
            Some(current) if current.is_complete() => continue,
            Some(current) => (false, current.role),
            None => (true, None),
        };
        match lookup_participant_info(store, user_id).await {
            Some(fresh) => {
                let fresh = fresh.with_role(role);
                if info.get(user_id) != Some(&fresh) {
                    info.insert(user_id.clone(), fresh);
                    changed = true;
                }
            }
            None if missing => {
                info.insert(user_id.clone(), ParticipantInfo::unknown().with_role(role));
                changed = true;
            }
            None => {}
        }
    }
    changed
}

pub fn build_message_page(messages: Vec<Message>, limit: usize) -> MessagePage {
    let next_before_ms = if messages.len() >= limit {
        messages.first().map(|message| message.created_at_ms)
    } else {
        None
    };
    MessagePage {
        messages,
        next_before_ms,
    }
}

fn ensure_participant(chat: &Chat, user_id: &str) -> DomainResult<()> {
    if chat.has_participant(user_id) {
        Ok(())
    } else {
        Err(DomainError::Unauthorized(format!(
            "not a participant of chat {}",
            chat.chat_id
        )))
    }
}

fn encode<T: Serialize>(value: &T) -> DomainResult<Value> {
    serde_json::to_value(value).map_err(|err| DomainError::InvalidArgument(err.to_string()))
}

fn dedupe_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

fn validate_pair<'a>(user_a: &'a str, user_b: &'a str) -> DomainResult<(&'a str, &'a str)> {
    let user_a = user_a.trim();
    let user_b = user_b.trim();
    if user_a.is_empty() || user_b.is_empty() {
        return Err(DomainError::InvalidArgument("both user ids are required".into()));
    }
    if user_a == user_b {
        return Err(DomainError::InvalidArgument(
            "a direct chat needs two different users".into(),
        ));
    }
    if user_a.contains(DIRECT_CHAT_SEPARATOR) || user_b.contains(DIRECT_CHAT_SEPARATOR) {
        return Err(DomainError::InvalidArgument(format!(
            "user ids cannot contain '{DIRECT_CHAT_SEPARATOR}'"
        )));
    }
    Ok((user_a, user_b))
}

fn validate_message_content(mut content: MessageContent) -> DomainResult<MessageContent> {
    content.text = content.text.trim().to_string();
    content.image_url = content
        .image_url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty());

    if content.text.is_empty() && content.image_url.is_none() {
        return Err(DomainError::InvalidArgument(
            "message needs text or an image".into(),
        ));
    }
    if content.text.chars().count() > MAX_TEXT_LENGTH {
        return Err(DomainError::InvalidArgument(format!(
            "message exceeds max length of {MAX_TEXT_LENGTH}"
        )));
    }
    Ok(content)
}

fn validate_group_create(creator_id: &str, mut input: GroupChatCreate) -> DomainResult<GroupChatCreate> {
    input.name = input.name.trim().to_string();
    input.description = input.description.trim().to_string();

    if input.name.is_empty() {
        return Err(DomainError::InvalidArgument("group name is required".into()));
    }
    if input.name.chars().count() > MAX_GROUP_NAME_LENGTH {
        return Err(DomainError::InvalidArgument(format!(
            "group name exceeds max length of {MAX_GROUP_NAME_LENGTH}"
        )));
    }
    if input.description.chars().count() > MAX_GROUP_DESCRIPTION_LENGTH {
        return Err(DomainError::InvalidArgument(format!(
            "group description exceeds max length of {MAX_GROUP_DESCRIPTION_LENGTH}"
        )));
    }

    let mut members = vec![creator_id.to_string()];
    members.extend(input.member_ids);
    input.member_ids = dedupe_ids(members);
    if input.member_ids.len() < 2 {
        return Err(DomainError::InvalidArgument(
            "a group chat needs at least one other member".into(),
        ));
    }
    if input.member_ids.len() > MAX_GROUP_MEMBERS {
        return Err(DomainError::InvalidArgument(format!(
            "groups are limited to {MAX_GROUP_MEMBERS} members"
        )));
    }
    Ok(input)
}

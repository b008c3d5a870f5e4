use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::DomainResult;
use crate::chat::{
    Chat, ChatService, DirectChatOpen, Message, MessageContent, ParticipantInfo, direct_chat_id,
};
use crate::documents::{self, Identified, MESSAGE_REQUESTS, request_path};
use crate::error::DomainError;
use crate::identity::IdentitySession;
use crate::ports::BoxStream;
use crate::ports::store::{DocumentStore, FieldPath, Query, StoreError, Transaction, Write};
use crate::profiles::{ProfileService, lookup_participant_info, participant_info};

const MAX_REQUEST_MESSAGE_LENGTH: usize = 1_000;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    #[serde(default)]
    pub request_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    #[serde(default)]
    pub message: String,
    pub status: RequestStatus,
    #[serde(default, rename = "createdAt")]
    pub created_at_ms: i64,
    #[serde(default)]
    pub sender_info: ParticipantInfo,
    #[serde(default, rename = "acceptedAt")]
    pub accepted_at_ms: Option<i64>,
    #[serde(default, rename = "rejectedAt")]
    pub rejected_at_ms: Option<i64>,
    #[serde(default)]
    pub chat_id: Option<String>,
}

impl Identified for MessageRequest {
    fn assign_id(&mut self, id: &str) {
        if self.request_id.is_empty() {
            self.request_id = id.to_string();
        }
    }
}

/// A request paired with the other party's current display info.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct RequestView {
    pub request: MessageRequest,
    pub counterpart: ParticipantInfo,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", content = "request", rename_all = "snake_case")]
pub enum SendRequestOutcome {
    Created(MessageRequest),
    /// A pending request to the same recipient already existed; nothing was written.
    AlreadyPending(MessageRequest),
}

impl SendRequestOutcome {
    pub fn request(&self) -> &MessageRequest {
        match self {
            Self::Created(request) | Self::AlreadyPending(request) => request,
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct AcceptedRequest {
    pub request: MessageRequest,
    pub chat: Chat,
    pub first_message: Option<Message>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum ConversationStart {
    Existing {
        chat: Chat,
        message: Option<Message>,
    },
    Opened {
        chat: Chat,
        message: Option<Message>,
    },
    Requested {
        outcome: SendRequestOutcome,
    },
}

#[derive(Clone)]
pub struct RequestService {
    store: Arc<dyn DocumentStore>,
    chats: ChatService,
    profiles: ProfileService,
}

impl RequestService {
    pub fn new(store: Arc<dyn DocumentStore>, chats: ChatService, profiles: ProfileService) -> Self {
        Self {
            store,
            chats,
            profiles,
        }
    }

    pub async fn send(
        &self,
        actor: &IdentitySession,
        recipient_id: &str,
        message: &str,
    ) -> DomainResult<SendRequestOutcome> {
        let recipient_id = recipient_id.trim();
        let message = message.trim();
        if recipient_id.is_empty() {
            return Err(DomainError::InvalidArgument("recipient_id is required".into()));
        }
        if recipient_id == actor.user_id {
            return Err(DomainError::InvalidArgument(
                "cannot send a message request to yourself".into(),
            ));
        }
        if message.chars().count() > MAX_REQUEST_MESSAGE_LENGTH {
            return Err(DomainError::InvalidArgument(format!(
                "message exceeds max length of {MAX_REQUEST_MESSAGE_LENGTH}"
            )));
        }

        let existing = self
            .store
            .query(
                &Query::collection(MESSAGE_REQUESTS)
                    .filter_eq("senderId", json!(actor.user_id))
                    .filter_eq("recipientId", json!(recipient_id))
                    .filter_eq("status", json!(RequestStatus::Pending.as_str()))
                    .limit(1),
            )
            .await?;
        if let Some(pending) = documents::decode_all::<MessageRequest>(existing).pop() {
            tracing::debug!(
                request_id = %pending.request_id,
                "pending message request already exists"
            );
            return Ok(SendRequestOutcome::AlreadyPending(pending));
        }

        let mut request = MessageRequest {
            request_id: crate::util::uuid_v7_without_dashes(),
            sender_id: actor.user_id.clone(),
            recipient_id: recipient_id.to_string(),
            message: message.to_string(),
            status: RequestStatus::Pending,
            created_at_ms: 0,
            sender_info: participant_info(self.store.as_ref(), &actor.user_id).await,
            accepted_at_ms: None,
            rejected_at_ms: None,
            chat_id: None,
        };
        let path = request_path(&request.request_id);
        let receipt = self
            .store
            .commit(
                Transaction::new()
                    .require_missing(path.clone())
                    .write(Write::set(path, &request)?.with_server_timestamp("createdAt")),
            )
            .await?;
        request.created_at_ms = receipt.commit_time_ms;

        tracing::info!(
            request_id = %request.request_id,
            recipient_id,
            "message request sent"
        );
        Ok(SendRequestOutcome::Created(request))
    }

    /// Opens (or reuses) the direct chat, durably marks the request accepted and then
    /// delivers the request text as the first message. A failed delivery is logged and
    /// leaves the acceptance in place.
    pub async fn accept(
        &self,
        actor: &IdentitySession,
        request_id: &str,
    ) -> DomainResult<AcceptedRequest> {
        let mut request = self.load_request(request_id).await?;
        if request.recipient_id != actor.user_id {
            return Err(DomainError::Unauthorized(
                "only the recipient can accept a message request".into(),
            ));
        }
        ensure_pending(&request)?;

        let chat_id = direct_chat_id(&request.sender_id, &request.recipient_id);
        let guard = acceptance(&request.request_id, &chat_id);
        let (chat, accepted_at_ms) = match self
            .chats
            .open_direct_chat(&request.sender_id, &request.recipient_id, guard)
            .await?
        {
            DirectChatOpen::Created {
                chat,
                commit_time_ms,
            } => (chat, commit_time_ms),
            DirectChatOpen::Existing(chat) => {
                let accepted_at_ms = self
                    .commit_resolution(
                        &request.request_id,
                        acceptance(&request.request_id, &chat_id),
                    )
                    .await?;
                (chat, accepted_at_ms)
            }
            DirectChatOpen::GuardFailed => {
                return Err(self.resolution_conflict(&request.request_id).await);
            }
        };
        request.status = RequestStatus::Accepted;
        request.chat_id = Some(chat.chat_id.clone());
        request.accepted_at_ms = Some(accepted_at_ms);
        tracing::info!(request_id = %request.request_id, chat_id = %chat.chat_id, "message request accepted");

        let chat = match self
            .chats
            .ensure_chat_participants(&chat.chat_id, &request.sender_id, &request.recipient_id)
            .await
        {
            Ok(repaired) => repaired,
            Err(err) => {
                tracing::warn!(chat_id = %chat.chat_id, error = %err, "participant repair after accept failed");
                chat
            }
        };

        let first_message = if request.message.trim().is_empty() {
            None
        } else {
            let sender = IdentitySession::with_user_id(request.sender_id.clone());
            match self
                .chats
                .send_message(&sender, &chat.chat_id, MessageContent::text(request.message.clone()))
                .await
            {
                Ok(message) => Some(message),
                Err(err) => {
                    tracing::warn!(
                        request_id = %request.request_id,
                        chat_id = %chat.chat_id,
                        error = %err,
                        "deferred first message was not delivered"
                    );
                    None
                }
            }
        };

        Ok(AcceptedRequest {
            request,
            chat,
            first_message,
        })
    }

    pub async fn reject(
        &self,
        actor: &IdentitySession,
        request_id: &str,
    ) -> DomainResult<MessageRequest> {
        let mut request = self.load_request(request_id).await?;
        if request.recipient_id != actor.user_id {
            return Err(DomainError::Unauthorized(
                "only the recipient can reject a message request".into(),
            ));
        }
        ensure_pending(&request)?;

        let receipt = self
            .commit_resolution(
                &request.request_id,
                pending_guarded(
                    &request.request_id,
                    vec![(FieldPath::new("status"), json!(RequestStatus::Rejected.as_str()))],
                    "rejectedAt",
                ),
            )
            .await?;
        request.status = RequestStatus::Rejected;
        request.rejected_at_ms = Some(receipt);
        tracing::info!(request_id = %request.request_id, "message request rejected");
        Ok(request)
    }

    /// Sender-side withdrawal of a request nobody has answered yet.
    pub async fn delete(&self, actor: &IdentitySession, request_id: &str) -> DomainResult<()> {
        let request = self.load_request(request_id).await?;
        if request.sender_id != actor.user_id {
            return Err(DomainError::Unauthorized(
                "only the sender can delete a message request".into(),
            ));
        }
        ensure_pending(&request)?;

        let path = request_path(&request.request_id);
        match self
            .store
            .commit(
                Transaction::new()
                    .require_field(
                        path.clone(),
                        "status",
                        json!(RequestStatus::Pending.as_str()),
                    )
                    .write(Write::delete(path)),
            )
            .await
        {
            Ok(_) => {
                tracing::info!(request_id = %request.request_id, "message request withdrawn");
                Ok(())
            }
            Err(StoreError::PreconditionFailed(_)) => Err(self.resolution_conflict(request_id).await),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn pending_sent_by(&self, user_id: &str) -> DomainResult<Vec<RequestView>> {
        let requests = self.pending_where("senderId", user_id).await?;
        let mut views = Vec::with_capacity(requests.len());
        for request in requests {
            let counterpart = participant_info(self.store.as_ref(), &request.recipient_id).await;
            views.push(RequestView {
                request,
                counterpart,
            });
        }
        Ok(views)
    }

    pub async fn pending_received_by(&self, user_id: &str) -> DomainResult<Vec<RequestView>> {
        let requests = self.pending_where("recipientId", user_id).await?;
        let mut views = Vec::with_capacity(requests.len());
        for request in requests {
            let counterpart = match lookup_participant_info(self.store.as_ref(), &request.sender_id).await {
                Some(info) => info,
                None if request.sender_info.is_complete() => request.sender_info.clone(),
                None => ParticipantInfo::unknown(),
            };
            views.push(RequestView {
                request,
                counterpart,
            });
        }
        Ok(views)
    }

    /// Live list of pending requests addressed to the user, newest first.
    pub async fn subscribe_to_message_requests(
        &self,
        user_id: &str,
    ) -> DomainResult<BoxStream<Vec<MessageRequest>>> {
        let snapshots = self
            .store
            .subscribe(&pending_query("recipientId", user_id))
            .await?;
        Ok(Box::pin(snapshots.map(documents::decode_all::<MessageRequest>)))
    }

    pub async fn check_mutual_follow(&self, user_a: &str, user_b: &str) -> bool {
        self.profiles.check_mutual_follow(user_a, user_b).await
    }

    /// Reuses an existing direct chat, opens one straight away for mutual followers,
    /// and otherwise files a message request carrying `text`.
    pub async fn start_conversation(
        &self,
        actor: &IdentitySession,
        recipient_id: &str,
        text: &str,
    ) -> DomainResult<ConversationStart> {
        let recipient_id = recipient_id.trim();
        if let Some(existing) = self
            .chats
            .check_existing_chat(&actor.user_id, recipient_id)
            .await?
        {
            let chat = self
                .chats
                .ensure_chat_participants(&existing.chat_id, &actor.user_id, recipient_id)
                .await?;
            let message = self.deliver_opening(actor, &chat, text).await?;
            return Ok(ConversationStart::Existing { chat, message });
        }

        if self.check_mutual_follow(&actor.user_id, recipient_id).await {
            let chat = self
                .chats
                .create_direct_chat(&actor.user_id, recipient_id)
                .await?;
            let message = self.deliver_opening(actor, &chat, text).await?;
            return Ok(ConversationStart::Opened { chat, message });
        }

        let outcome = self.send(actor, recipient_id, text).await?;
        Ok(ConversationStart::Requested { outcome })
    }

    async fn deliver_opening(
        &self,
        actor: &IdentitySession,
        chat: &Chat,
        text: &str,
    ) -> DomainResult<Option<Message>> {
        if text.trim().is_empty() || !chat.is_active {
            return Ok(None);
        }
        let message = self
            .chats
            .send_message(actor, &chat.chat_id, MessageContent::text(text))
            .await?;
        Ok(Some(message))
    }

    async fn load_request(&self, request_id: &str) -> DomainResult<MessageRequest> {
        let request_id = request_id.trim();
        if request_id.is_empty() {
            return Err(DomainError::InvalidArgument("request_id is required".into()));
        }
        documents::load(self.store.as_ref(), &request_path(request_id))
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("message request {request_id}")))
    }

    /// Concurrent accept/reject calls cannot both succeed: the loser fails the
    /// `status == pending` precondition.
    async fn commit_resolution(
        &self,
        request_id: &str,
        transaction: Transaction,
    ) -> DomainResult<i64> {
        match self.store.commit(transaction).await {
            Ok(receipt) => Ok(receipt.commit_time_ms),
            Err(StoreError::PreconditionFailed(_)) => Err(self.resolution_conflict(request_id).await),
            Err(err) => Err(err.into()),
        }
    }

    async fn resolution_conflict(&self, request_id: &str) -> DomainError {
        match documents::load::<MessageRequest>(self.store.as_ref(), &request_path(request_id)).await {
            Ok(Some(_)) => DomainError::AlreadyResolved,
            Ok(None) => DomainError::NotFound(format!("message request {request_id}")),
            Err(err) => err,
        }
    }

    async fn pending_where(&self, field: &str, user_id: &str) -> DomainResult<Vec<MessageRequest>> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(DomainError::InvalidArgument("user_id is required".into()));
        }
        let documents = self.store.query(&pending_query(field, user_id)).await?;
        Ok(documents::decode_all(documents))
    }
}

/// The pending-guarded status flip for an acceptance. Committed on its own, or
/// together with the chat it opens so a concurrent rejection leaves no room behind.
fn acceptance(request_id: &str, chat_id: &str) -> Transaction {
    pending_guarded(
        request_id,
        vec![
            (FieldPath::new("status"), json!(RequestStatus::Accepted.as_str())),
            (FieldPath::new("chatId"), json!(chat_id)),
        ],
        "acceptedAt",
    )
}

fn pending_guarded(
    request_id: &str,
    fields: Vec<(FieldPath, serde_json::Value)>,
    stamp_field: &str,
) -> Transaction {
    let path = request_path(request_id);
    Transaction::new()
        .require_field(path.clone(), "status", json!(RequestStatus::Pending.as_str()))
        .write(Write::update(path, fields).with_server_timestamp(stamp_field))
}

fn pending_query(field: &str, user_id: &str) -> Query {
    Query::collection(MESSAGE_REQUESTS)
        .filter_eq(field, json!(user_id))
        .filter_eq("status", json!(RequestStatus::Pending.as_str()))
        .order_by_desc("createdAt")
}

fn ensure_pending(request: &MessageRequest) -> DomainResult<()> {
    if request.status == RequestStatus::Pending {
        Ok(())
    } else {
        Err(DomainError::AlreadyResolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatSettings;
    use crate::documents::profile_path;
    use crate::memory_store::InMemoryDocumentStore;
    use crate::ports::BoxFuture;
    use crate::ports::store::{CommitReceipt, DocPath, Document, DocumentStream, StoreResult};
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

    const ALICE: &str = "user-alice";
    const BOB: &str = "user-bobby";
    const CAROL: &str = "user-carol";

    fn service() -> (Arc<InMemoryDocumentStore>, RequestService) {
        let store = Arc::new(InMemoryDocumentStore::new());
        let chats = ChatService::new(store.clone(), ChatSettings::default());
        let profiles = ProfileService::new(store.clone());
        (store.clone(), RequestService::new(store, chats, profiles))
    }

    #[tokio::test]
    async fn double_send_is_a_noop() {
        let (store, service) = service();
        let alice = IdentitySession::with_user_id(ALICE);

        let first = service.send(&alice, BOB, "hi").await.expect("send");
        let second = service.send(&alice, BOB, "hi again").await.expect("send");

        assert!(matches!(first, SendRequestOutcome::Created(_)));
        assert!(matches!(second, SendRequestOutcome::AlreadyPending(_)));
        assert_eq!(first.request().request_id, second.request().request_id);
        assert_eq!(store.document_count(MESSAGE_REQUESTS).await, 1);
    }

    #[tokio::test]
    async fn only_recipient_resolves() {
        let (_, service) = service();
        let alice = IdentitySession::with_user_id(ALICE);
        let carol = IdentitySession::with_user_id(CAROL);
        let sent = service.send(&alice, BOB, "hi").await.expect("send");
        let request_id = sent.request().request_id.clone();

        let err = service.accept(&carol, &request_id).await.unwrap_err();
        assert!(matches!(err, DomainError::Unauthorized(_)));
        let err = service.reject(&alice, &request_id).await.unwrap_err();
        assert!(matches!(err, DomainError::Unauthorized(_)));
        let err = service.accept(&carol, "missing").await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_is_sender_only_and_pending_only() {
        let (store, service) = service();
        let alice = IdentitySession::with_user_id(ALICE);
        let bob = IdentitySession::with_user_id(BOB);
        let sent = service.send(&alice, BOB, "").await.expect("send");
        let request_id = sent.request().request_id.clone();

        let err = service.delete(&bob, &request_id).await.unwrap_err();
        assert!(matches!(err, DomainError::Unauthorized(_)));

        service.delete(&alice, &request_id).await.expect("withdraw");
        assert_eq!(store.document_count(MESSAGE_REQUESTS).await, 0);

        let sent = service.send(&alice, BOB, "").await.expect("resend");
        let request_id = sent.request().request_id.clone();
        service.reject(&bob, &request_id).await.expect("reject");
        let err = service.delete(&alice, &request_id).await.unwrap_err();
        assert!(matches!(err, DomainError::AlreadyResolved));
    }

    #[tokio::test]
    async fn accept_without_text_sends_nothing() {
        let (_, service) = service();
        let alice = IdentitySession::with_user_id(ALICE);
        let bob = IdentitySession::with_user_id(BOB);
        let sent = service.send(&alice, BOB, "  ").await.expect("send");

        let accepted = service
            .accept(&bob, &sent.request().request_id)
            .await
            .expect("accept");
        assert!(accepted.first_message.is_none());
        assert!(accepted.chat.last_message.is_none());
    }

    #[tokio::test]
    async fn failed_first_message_keeps_acceptance() {
        let (store, service) = service();
        let alice = IdentitySession::with_user_id(ALICE);
        let bob = IdentitySession::with_user_id(BOB);
        let sent = service.send(&alice, BOB, "hello").await.expect("send");
        let chat_id = crate::chat::direct_chat_id(ALICE, BOB);
        store
            .fail_writes_under(documents::messages_collection(&chat_id))
            .await;

        let accepted = service
            .accept(&bob, &sent.request().request_id)
            .await
            .expect("accept");
        assert!(accepted.first_message.is_none());
        assert_eq!(accepted.request.status, RequestStatus::Accepted);

        let stored: MessageRequest = documents::load(store.as_ref(), &request_path(&sent.request().request_id))
            .await
            .expect("load")
            .expect("request");
        assert_eq!(stored.status, RequestStatus::Accepted);
        assert_eq!(stored.chat_id, Some(chat_id));
    }

    /// Lands a rejection of `request_id` right before the first commit that writes a chat.
    struct RejectBeforeChatCommit {
        inner: Arc<InMemoryDocumentStore>,
        request_id: String,
        fired: AtomicBool,
    }

    impl DocumentStore for RejectBeforeChatCommit {
        fn get(&self, path: &DocPath) -> BoxFuture<'_, StoreResult<Option<Document>>> {
            self.inner.get(path)
        }

        fn query(&self, query: &Query) -> BoxFuture<'_, StoreResult<Vec<Document>>> {
            self.inner.query(query)
        }

        fn subscribe(&self, query: &Query) -> BoxFuture<'_, StoreResult<DocumentStream>> {
            self.inner.subscribe(query)
        }

        fn commit(&self, transaction: Transaction) -> BoxFuture<'_, StoreResult<CommitReceipt>> {
            Box::pin(async move {
                let writes_chat = transaction
                    .writes
                    .iter()
                    .any(|write| write.path.collection() == documents::CHATS);
                if writes_chat && !self.fired.swap(true, AtomicOrdering::SeqCst) {
                    self.inner
                        .commit(Transaction::new().write(Write::update(
                            request_path(&self.request_id),
                            vec![(FieldPath::new("status"), json!("rejected"))],
                        )))
                        .await?;
                }
                self.inner.commit(transaction).await
            })
        }

        fn batch_write(&self, writes: Vec<Write>) -> BoxFuture<'_, StoreResult<CommitReceipt>> {
            self.inner.batch_write(writes)
        }
    }

    #[tokio::test]
    async fn rejection_racing_accept_leaves_no_chat() {
        let (memory, service) = service();
        let alice = IdentitySession::with_user_id(ALICE);
        let bob = IdentitySession::with_user_id(BOB);
        let sent = service.send(&alice, BOB, "hi").await.expect("send");
        let request_id = sent.request().request_id.clone();

        let racing: Arc<dyn DocumentStore> = Arc::new(RejectBeforeChatCommit {
            inner: memory.clone(),
            request_id: request_id.clone(),
            fired: AtomicBool::new(false),
        });
        let chats = ChatService::new(racing.clone(), ChatSettings::default());
        let racing_service =
            RequestService::new(racing.clone(), chats.clone(), ProfileService::new(racing));

        let err = racing_service.accept(&bob, &request_id).await.unwrap_err();
        assert!(matches!(err, DomainError::AlreadyResolved));

        let chat_id = crate::chat::direct_chat_id(ALICE, BOB);
        assert_eq!(memory.document_count(documents::CHATS).await, 0);
        assert!(memory.get(&documents::inbox_path(BOB, &chat_id)).await.expect("get").is_none());
        let err = chats
            .send_message(&alice, &chat_id, MessageContent::text("still there?"))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));

        let stored: MessageRequest = documents::load(memory.as_ref(), &request_path(&request_id))
            .await
            .expect("load")
            .expect("request");
        assert_eq!(stored.status, RequestStatus::Rejected);
        assert_eq!(stored.chat_id, None);
    }

    #[tokio::test]
    async fn accept_reuses_existing_chat() {
        let (store, service) = service();
        let alice = IdentitySession::with_user_id(ALICE);
        let bob = IdentitySession::with_user_id(BOB);
        let chats = ChatService::new(store.clone(), ChatSettings::default());
        let existing = chats.create_direct_chat(ALICE, BOB).await.expect("chat");
        let sent = service.send(&alice, BOB, "").await.expect("send");

        let accepted = service
            .accept(&bob, &sent.request().request_id)
            .await
            .expect("accept");
        assert_eq!(accepted.chat.chat_id, existing.chat_id);
        assert_eq!(accepted.request.chat_id, Some(existing.chat_id));
        assert_eq!(store.document_count(documents::CHATS).await, 1);

        let err = service.reject(&bob, &sent.request().request_id).await.unwrap_err();
        assert!(matches!(err, DomainError::AlreadyResolved));
    }

    #[tokio::test]
    async fn received_view_prefers_live_profile() {
        let (store, service) = service();
        let alice = IdentitySession::with_user_id(ALICE);
        service.send(&alice, BOB, "hi").await.expect("send");
        store
            .seed(profile_path(ALICE), json!({ "name": "Alice", "username": "alice" }))
            .await;

        let received = service.pending_received_by(BOB).await.expect("received");
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].request.sender_info, ParticipantInfo::unknown());
        assert_eq!(received[0].counterpart.name, "Alice");

        let sent = service.pending_sent_by(ALICE).await.expect("sent");
        assert_eq!(sent[0].counterpart, ParticipantInfo::unknown());
    }

    #[tokio::test]
    async fn start_conversation_picks_path() {
        let (store, service) = service();
        let alice = IdentitySession::with_user_id(ALICE);

        let start = service.start_conversation(&alice, BOB, "hey").await.expect("start");
        assert!(matches!(start, ConversationStart::Requested { .. }));

        store.seed(documents::following_path(ALICE, CAROL), json!({ "followerId": ALICE })).await;
        store.seed(documents::following_path(CAROL, ALICE), json!({ "followerId": CAROL })).await;
        let start = service.start_conversation(&alice, CAROL, "hey").await.expect("start");
        let ConversationStart::Opened { chat, message } = start else {
            panic!("expected a direct chat for mutual followers");
        };
        assert_eq!(message.expect("opening message").text, "hey");

        let start = service.start_conversation(&alice, CAROL, "").await.expect("again");
        let ConversationStart::Existing { chat: reused, message } = start else {
            panic!("expected the existing chat to be reused");
        };
        assert_eq!(reused.chat_id, chat.chat_id);
        assert!(message.is_none());
    }

    #[tokio::test]
    async fn subscription_tracks_pending_requests() {
        let (_, service) = service();
        let alice = IdentitySession::with_user_id(ALICE);
        let bob = IdentitySession::with_user_id(BOB);
        let mut stream = service
            .subscribe_to_message_requests(BOB)
            .await
            .expect("subscribe");
        assert!(stream.next().await.expect("initial").is_empty());

        let sent = service.send(&alice, BOB, "hi").await.expect("send");
        assert_eq!(stream.next().await.expect("after send").len(), 1);

        service
            .reject(&bob, &sent.request().request_id)
            .await
            .expect("reject");
        assert!(stream.next().await.expect("after reject").is_empty());
    }
}

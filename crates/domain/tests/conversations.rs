use std::sync::Arc;

use huddle_domain::chat::{
    ChatService, ChatSettings, GroupChatCreate, MessageContent, direct_chat_id,
};
use huddle_domain::documents::{
    CHATS, chat_path, inbox_path, message_path, messages_collection, profile_path,
};
use huddle_domain::error::DomainError;
use huddle_domain::identity::IdentitySession;
use huddle_domain::inbox::{InboxEntry, InboxService};
use huddle_domain::memory_store::InMemoryDocumentStore;
use huddle_domain::ports::store::{DocumentStore, Query};
use huddle_domain::profiles::ProfileService;
use huddle_domain::requests::{RequestService, RequestStatus, SendRequestOutcome};
use serde_json::json;

const ALICE: &str = "user-alice";
const BOB: &str = "user-bobby";
const CAROL: &str = "user-carol";

struct Harness {
    store: Arc<InMemoryDocumentStore>,
    chats: ChatService,
    inbox: InboxService,
    requests: RequestService,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryDocumentStore::new());
    let settings = ChatSettings::default();
    let chats = ChatService::new(store.clone(), settings.clone());
    let inbox = InboxService::new(store.clone(), settings);
    let profiles = ProfileService::new(store.clone());
    let requests = RequestService::new(store.clone(), chats.clone(), profiles);
    Harness {
        store,
        chats,
        inbox,
        requests,
    }
}

fn session(user_id: &str) -> IdentitySession {
    IdentitySession::with_user_id(user_id)
}

async fn entry(store: &InMemoryDocumentStore, user_id: &str, chat_id: &str) -> Option<InboxEntry> {
    store
        .get(&inbox_path(user_id, chat_id))
        .await
        .expect("get entry")
        .map(|document| document.decode().expect("decode entry"))
}

async fn seed_profile(store: &InMemoryDocumentStore, user_id: &str, name: &str) {
    store
        .seed(
            profile_path(user_id),
            json!({ "name": name, "username": name.to_lowercase() }),
        )
        .await;
}

#[tokio::test]
async fn direct_chat_creation_is_idempotent() {
    let h = harness();
    seed_profile(&h.store, ALICE, "Alice").await;
    seed_profile(&h.store, BOB, "Bob").await;

    let first = h.chats.create_direct_chat(ALICE, BOB).await.expect("first");
    seed_profile(&h.store, ALICE, "Alice Renamed").await;
    let second = h.chats.create_direct_chat(BOB, ALICE).await.expect("second");

    assert_eq!(first.chat_id, second.chat_id);
    assert_eq!(first.participants_info, second.participants_info);
    assert_eq!(second.participants_info[ALICE].name, "Alice");
    assert_eq!(h.store.document_count(CHATS).await, 1);
    assert_eq!(first.created_at_ms, second.created_at_ms);
}

#[tokio::test]
async fn every_participant_has_an_inbox_entry() {
    let h = harness();
    let alice = session(ALICE);

    let direct = h.chats.create_direct_chat(ALICE, BOB).await.expect("direct");
    let group = h
        .chats
        .create_group_chat(
            &alice,
            GroupChatCreate {
                name: "Crew".to_string(),
                description: "weekend plans".to_string(),
                avatar: None,
                member_ids: vec![BOB.to_string(), CAROL.to_string()],
            },
        )
        .await
        .expect("group");
    let ensured = h
        .chats
        .ensure_chat_participants(&direct_chat_id(BOB, CAROL), BOB, CAROL)
        .await
        .expect("ensure creates the chat");

    for chat in [&direct, &group, &ensured] {
        for participant in &chat.participants {
            assert!(
                entry(&h.store, participant, &chat.chat_id).await.is_some(),
                "{participant} is missing an entry for {}",
                chat.chat_id
            );
        }
    }
}

#[tokio::test]
async fn ensure_participants_repairs_missing_entry() {
    let h = harness();
    let chat = h.chats.create_direct_chat(ALICE, BOB).await.expect("chat");
    h.store
        .seed(
            chat_path(&chat.chat_id),
            json!({ "chat_id": chat.chat_id, "type": "direct", "participants": [BOB] }),
        )
        .await;

    let repaired = h
        .chats
        .ensure_chat_participants(&chat.chat_id, ALICE, BOB)
        .await
        .expect("repair");
    assert_eq!(repaired.participants, vec![BOB, ALICE]);
    assert!(repaired.participants_info.contains_key(ALICE));
}

#[tokio::test]
async fn request_resolves_exactly_once() {
    let h = harness();
    let alice = session(ALICE);
    let bob = session(BOB);

    let sent = h.requests.send(&alice, BOB, "hi").await.expect("send");
    let request_id = sent.request().request_id.clone();
    h.requests.accept(&bob, &request_id).await.expect("accept");

    let err = h.requests.reject(&bob, &request_id).await.unwrap_err();
    assert!(matches!(err, DomainError::AlreadyResolved));
    let err = h.requests.accept(&bob, &request_id).await.unwrap_err();
    assert!(matches!(err, DomainError::AlreadyResolved));

    let chat_id = direct_chat_id(ALICE, BOB);
    assert_eq!(h.store.document_count(CHATS).await, 1);
    assert_eq!(
        h.store.document_count(&messages_collection(&chat_id)).await,
        1
    );
}

#[tokio::test]
async fn rejected_request_never_opens_a_chat() {
    let h = harness();
    let alice = session(ALICE);
    let bob = session(BOB);

    let sent = h.requests.send(&alice, BOB, "hi").await.expect("send");
    let rejected = h
        .requests
        .reject(&bob, &sent.request().request_id)
        .await
        .expect("reject");
    assert_eq!(rejected.status, RequestStatus::Rejected);
    assert!(rejected.rejected_at_ms.is_some());

    let err = h
        .requests
        .accept(&bob, &sent.request().request_id)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::AlreadyResolved));
    assert_eq!(h.store.document_count(CHATS).await, 0);
}

#[tokio::test]
async fn unread_counts_track_sends_and_reset_on_read() {
    let h = harness();
    let alice = session(ALICE);
    let bob = session(BOB);
    let chat = h.chats.create_direct_chat(ALICE, BOB).await.expect("chat");

    for index in 0..7 {
        h.chats
            .send_message(&alice, &chat.chat_id, MessageContent::text(format!("msg {index}")))
            .await
            .expect("send");
    }
    assert_eq!(
        entry(&h.store, BOB, &chat.chat_id).await.expect("entry").unread_count,
        7
    );
    assert_eq!(
        entry(&h.store, ALICE, &chat.chat_id).await.expect("entry").unread_count,
        0
    );

    h.chats
        .mark_messages_as_read(&bob, &chat.chat_id)
        .await
        .expect("read");
    let bob_entry = entry(&h.store, BOB, &chat.chat_id).await.expect("entry");
    assert_eq!(bob_entry.unread_count, 0);
    assert!(bob_entry.last_read_at_ms.is_some());
}

#[tokio::test]
async fn concurrent_sends_do_not_lose_unread_increments() {
    let h = harness();
    let chat = h.chats.create_direct_chat(ALICE, BOB).await.expect("chat");

    let mut handles = Vec::new();
    for index in 0..20 {
        let chats = h.chats.clone();
        let chat_id = chat.chat_id.clone();
        handles.push(tokio::spawn(async move {
            let alice = session(ALICE);
            chats
                .send_message(&alice, &chat_id, MessageContent::text(format!("m{index}")))
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("send");
    }

    assert_eq!(
        entry(&h.store, BOB, &chat.chat_id).await.expect("entry").unread_count,
        20
    );
}

#[tokio::test]
async fn reconcile_rebuilds_participants_from_chat_id() {
    let h = harness();
    let chat_id = direct_chat_id(ALICE, BOB);
    h.store
        .seed(
            chat_path(&chat_id),
            json!({ "type": "direct", "is_active": true, "created_at_ms": 1 }),
        )
        .await;
    h.store
        .seed(inbox_path(ALICE, &chat_id), json!({ "chat_id": chat_id }))
        .await;
    assert!(h.inbox.list_conversations(BOB).await.expect("list").is_empty());

    let report = h.inbox.reconcile(ALICE).await.expect("reconcile");
    assert_eq!(report.reconstructed, vec![chat_id.clone()]);
    assert!(report.unrecoverable.is_empty());

    let stored = h
        .store
        .get(&chat_path(&chat_id))
        .await
        .expect("get")
        .expect("chat");
    assert_eq!(stored.data["participants"], json!([ALICE, BOB]));

    for user_id in [ALICE, BOB] {
        let list = h.inbox.list_conversations(user_id).await.expect("list");
        assert_eq!(list.len(), 1, "{user_id} should see the chat");
        assert_eq!(list[0].chat.chat_id, chat_id);
    }

    let again = h.inbox.reconcile(ALICE).await.expect("second reconcile");
    assert!(again.reconstructed.is_empty());
}

#[tokio::test]
async fn request_lifecycle_delivers_first_message() {
    let h = harness();
    let alice = session(ALICE);
    let bob = session(BOB);

    let outcome = h.requests.send(&alice, BOB, "hi").await.expect("send");
    let SendRequestOutcome::Created(request) = outcome else {
        panic!("expected a new request");
    };
    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(
        h.requests.pending_received_by(BOB).await.expect("received").len(),
        1
    );

    let accepted = h
        .requests
        .accept(&bob, &request.request_id)
        .await
        .expect("accept");
    assert_eq!(accepted.request.status, RequestStatus::Accepted);
    assert_eq!(accepted.request.chat_id.as_deref(), Some(accepted.chat.chat_id.as_str()));
    assert!(accepted.chat.has_participant(ALICE));
    assert!(accepted.chat.has_participant(BOB));

    let page = h
        .chats
        .fetch_messages(&bob, &accepted.chat.chat_id, None, None)
        .await
        .expect("messages");
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].text, "hi");
    assert_eq!(page.messages[0].sender_id, ALICE);

    assert!(h.requests.pending_received_by(BOB).await.expect("received").is_empty());
    assert!(h.requests.pending_sent_by(ALICE).await.expect("sent").is_empty());
    assert_eq!(
        entry(&h.store, BOB, &accepted.chat.chat_id).await.expect("entry").unread_count,
        1
    );
}

#[tokio::test]
async fn permanent_deletion_is_exhaustive() {
    let h = harness();
    let alice = session(ALICE);
    let chat = h
        .chats
        .create_group_chat(
            &alice,
            GroupChatCreate {
                name: "Archive".to_string(),
                member_ids: vec![BOB.to_string(), CAROL.to_string()],
                ..GroupChatCreate::default()
            },
        )
        .await
        .expect("group");

    let senders = [ALICE, BOB, CAROL];
    for index in 0..1_200 {
        let message_id = format!("m{index:05}");
        h.store
            .seed(
                message_path(&chat.chat_id, &message_id),
                json!({
                    "message_id": message_id,
                    "chat_id": chat.chat_id,
                    "sender_id": senders[index % senders.len()],
                    "text": format!("message {index}"),
                    "created_at_ms": index as i64 + 1,
                }),
            )
            .await;
    }
    assert_eq!(
        h.store.document_count(&messages_collection(&chat.chat_id)).await,
        1_200
    );

    let report = h
        .chats
        .delete_chat_permanently(&alice, &chat.chat_id)
        .await
        .expect("delete");
    assert_eq!(report.messages_deleted, 1_200);
    assert_eq!(report.inbox_entries_deleted, 3);

    let remaining = h
        .store
        .query(&Query::collection(messages_collection(&chat.chat_id)))
        .await
        .expect("query");
    assert!(remaining.is_empty());
    for user_id in senders {
        assert!(entry(&h.store, user_id, &chat.chat_id).await.is_none());
    }
    assert!(h.store.get(&chat_path(&chat.chat_id)).await.expect("get").is_none());

    let err = h
        .chats
        .delete_chat_permanently(&alice, &chat.chat_id)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::NotFound(_)));
}

#[tokio::test]
async fn interrupted_deletion_can_resume() {
    let h = harness();
    let alice = session(ALICE);
    let chat = h.chats.create_direct_chat(ALICE, BOB).await.expect("chat");
    for index in 0..10 {
        h.chats
            .send_message(&alice, &chat.chat_id, MessageContent::text(format!("m{index}")))
            .await
            .expect("send");
    }

    h.store
        .fail_writes_under(inbox_path(BOB, &chat.chat_id).to_string())
        .await;
    let err = h
        .chats
        .delete_chat_permanently(&alice, &chat.chat_id)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::TransactionFailed(_)));
    assert_eq!(
        h.store.document_count(&messages_collection(&chat.chat_id)).await,
        0
    );
    assert!(h.store.get(&chat_path(&chat.chat_id)).await.expect("get").is_some());

    h.store.clear_failures().await;
    let report = h
        .chats
        .delete_chat_permanently(&alice, &chat.chat_id)
        .await
        .expect("resume");
    assert_eq!(report.messages_deleted, 0);
    assert!(h.store.get(&chat_path(&chat.chat_id)).await.expect("get").is_none());
}

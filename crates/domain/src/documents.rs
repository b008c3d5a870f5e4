//! Collection layout and typed access helpers over the document store.

use serde::de::DeserializeOwned;

use crate::DomainResult;
use crate::ports::store::{DocPath, Document, DocumentStore};

pub const PROFILES: &str = "profile";
pub const FOLLOWING: &str = "following";
pub const CHATS: &str = "chats";
pub const MESSAGES: &str = "messages";
pub const USER_CHATS: &str = "userChats";
pub const USER_CHAT_ENTRIES: &str = "chats";
pub const MESSAGE_REQUESTS: &str = "messageRequests";
pub const PROJECTS: &str = "projects";

pub fn profile_path(user_id: &str) -> DocPath {
    DocPath::new(PROFILES, user_id)
}

pub fn following_collection(follower_id: &str) -> String {
    profile_path(follower_id).child_collection(FOLLOWING)
}

pub fn following_path(follower_id: &str, followee_id: &str) -> DocPath {
    DocPath::new(following_collection(follower_id), followee_id)
}

pub fn chat_path(chat_id: &str) -> DocPath {
    DocPath::new(CHATS, chat_id)
}

pub fn messages_collection(chat_id: &str) -> String {
    chat_path(chat_id).child_collection(MESSAGES)
}

pub fn message_path(chat_id: &str, message_id: &str) -> DocPath {
    DocPath::new(messages_collection(chat_id), message_id)
}

pub fn inbox_collection(user_id: &str) -> String {
    DocPath::new(USER_CHATS, user_id).child_collection(USER_CHAT_ENTRIES)
}

pub fn inbox_path(user_id: &str, chat_id: &str) -> DocPath {
    DocPath::new(inbox_collection(user_id), chat_id)
}

pub fn request_path(request_id: &str) -> DocPath {
    DocPath::new(MESSAGE_REQUESTS, request_id)
}

pub fn project_path(project_id: &str) -> DocPath {
    DocPath::new(PROJECTS, project_id)
}

/// Documents whose stored shape predates a field fall back on the path id.
pub trait Identified {
    fn assign_id(&mut self, id: &str);
}

pub async fn load<T>(store: &dyn DocumentStore, path: &DocPath) -> DomainResult<Option<T>>
where
    T: DeserializeOwned + Identified,
{
    let Some(document) = store.get(path).await? else {
        return Ok(None);
    };
    let mut value: T = document.decode()?;
    value.assign_id(document.id());
    Ok(Some(value))
}

/// Decodes a result set, skipping (and logging) documents that no longer fit the model.
pub fn decode_all<T>(documents: Vec<Document>) -> Vec<T>
where
    T: DeserializeOwned + Identified,
{
    documents
        .into_iter()
        .filter_map(|document| match document.decode::<T>() {
            Ok(mut value) => {
                value.assign_id(document.id());
                Some(value)
            }
            Err(err) => {
                tracing::warn!(path = %document.path, error = %err, "skipping undecodable document");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_paths_follow_collection_layout() {
        assert_eq!(inbox_path("u1", "c1").to_string(), "userChats/u1/chats/c1");
        assert_eq!(message_path("c1", "m1").to_string(), "chats/c1/messages/m1");
        assert_eq!(following_path("a", "b").to_string(), "profile/a/following/b");
    }
}

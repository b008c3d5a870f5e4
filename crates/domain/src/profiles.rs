use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::chat::ParticipantInfo;
use crate::documents::{self, Identified, following_path, profile_path};
use crate::error::DomainError;
use crate::identity::IdentitySession;
use crate::ports::store::{DocumentStore, Transaction, Write};

const MAX_NAME_LENGTH: usize = 80;
const MAX_USERNAME_LENGTH: usize = 40;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default, rename = "updatedAt")]
    pub updated_at_ms: i64,
}

impl Identified for UserProfile {
    fn assign_id(&mut self, id: &str) {
        if self.user_id.is_empty() {
            self.user_id = id.to_string();
        }
    }
}

impl UserProfile {
    pub fn participant_info(&self) -> ParticipantInfo {
        ParticipantInfo {
            name: self.name.clone(),
            username: self.username.clone(),
            avatar: self.avatar.clone(),
            role: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProfileUpdate {
    pub name: String,
    pub username: String,
    pub avatar: Option<String>,
    pub bio: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FollowEdge {
    #[serde(default)]
    pub followee_id: String,
    pub follower_id: String,
    #[serde(default, rename = "createdAt")]
    pub created_at_ms: i64,
}

impl Identified for FollowEdge {
    fn assign_id(&mut self, id: &str) {
        if self.followee_id.is_empty() {
            self.followee_id = id.to_string();
        }
    }
}

#[derive(Clone)]
pub struct ProfileService {
    store: Arc<dyn DocumentStore>,
}

impl ProfileService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn upsert_profile(
        &self,
        actor: &IdentitySession,
        input: ProfileUpdate,
    ) -> DomainResult<UserProfile> {
        let input = validate_profile_update(input)?;
        let mut profile = UserProfile {
            user_id: actor.user_id.clone(),
            name: input.name,
            username: input.username,
            avatar: input.avatar,
            bio: input.bio,
            updated_at_ms: 0,
        };
        let receipt = self
            .store
            .commit(Transaction::new().write(
                Write::set(profile_path(&actor.user_id), &profile)?
                    .with_server_timestamp("updatedAt"),
            ))
            .await?;
        profile.updated_at_ms = receipt.commit_time_ms;
        Ok(profile)
    }

    pub async fn get_profile(&self, user_id: &str) -> DomainResult<Option<UserProfile>> {
        documents::load(self.store.as_ref(), &profile_path(user_id)).await
    }

    pub async fn follow(&self, actor: &IdentitySession, followee_id: &str) -> DomainResult<()> {
        let followee_id = followee_id.trim();
        if followee_id.is_empty() {
            return Err(DomainError::InvalidArgument("followee_id is required".into()));
        }
        if followee_id == actor.user_id {
            return Err(DomainError::InvalidArgument("cannot follow yourself".into()));
        }
        let edge = FollowEdge {
            followee_id: followee_id.to_string(),
            follower_id: actor.user_id.clone(),
            created_at_ms: 0,
        };
        self.store
            .commit(Transaction::new().write(
                Write::set(following_path(&actor.user_id, followee_id), &edge)?
                    .with_server_timestamp("createdAt"),
            ))
            .await?;
        Ok(())
    }

    pub async fn unfollow(&self, actor: &IdentitySession, followee_id: &str) -> DomainResult<()> {
        self.store
            .commit(
                Transaction::new()
                    .write(Write::delete(following_path(&actor.user_id, followee_id.trim()))),
            )
            .await?;
        Ok(())
    }

    pub async fn is_following(&self, follower_id: &str, followee_id: &str) -> DomainResult<bool> {
        Ok(self
            .store
            .get(&following_path(follower_id, followee_id))
            .await?
            .is_some())
    }

    /// Dual point-read of the follow edges. Any read failure counts as "not
    /// mutual" so callers fall back on the message-request flow.
    pub async fn check_mutual_follow(&self, user_a: &str, user_b: &str) -> bool {
        let forward = self.is_following(user_a, user_b).await;
        let backward = self.is_following(user_b, user_a).await;
        match (forward, backward) {
            (Ok(forward), Ok(backward)) => forward && backward,
            (Err(err), _) | (_, Err(err)) => {
                tracing::warn!(user_a, user_b, error = %err, "mutual follow check failed");
                false
            }
        }
    }
}

/// Reads the display snapshot for a user, `None` when the profile is absent or unreadable.
pub(crate) async fn lookup_participant_info(
    store: &dyn DocumentStore,
    user_id: &str,
) -> Option<ParticipantInfo> {
    match documents::load::<UserProfile>(store, &profile_path(user_id)).await {
        Ok(Some(profile)) => Some(profile.participant_info()),
        Ok(None) => {
            tracing::debug!(user_id, "no profile found; using placeholder participant info");
            None
        }
        Err(err) => {
            tracing::warn!(user_id, error = %err, "profile lookup failed; using placeholder");
            None
        }
    }
}

/// Never fails: missing or unreadable profiles degrade to the placeholder.
pub(crate) async fn participant_info(store: &dyn DocumentStore, user_id: &str) -> ParticipantInfo {
    lookup_participant_info(store, user_id)
        .await
        .unwrap_or_else(ParticipantInfo::unknown)
}

fn validate_profile_update(mut input: ProfileUpdate) -> DomainResult<ProfileUpdate> {
    input.name = input.name.trim().to_string();
    input.username = input.username.trim().to_lowercase();

    if input.name.is_empty() {
        return Err(DomainError::InvalidArgument("name is required".into()));
    }
    if input.name.chars().count() > MAX_NAME_LENGTH {
        return Err(DomainError::InvalidArgument(format!(
            "name exceeds max length of {MAX_NAME_LENGTH}"
        )));
    }
    if input.username.is_empty() || input.username.chars().count() > MAX_USERNAME_LENGTH {
        return Err(DomainError::InvalidArgument(format!(
            "username must be 1-{MAX_USERNAME_LENGTH} characters"
        )));
    }
    if input.username.chars().any(char::is_whitespace) {
        return Err(DomainError::InvalidArgument(
            "username cannot contain whitespace".into(),
        ));
    }
    Ok(input)
}

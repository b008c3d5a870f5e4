use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::DomainResult;
use crate::chat::{ChatService, GroupChatCreate};
use crate::documents::{self, Identified, project_path};
use crate::error::DomainError;
use crate::identity::IdentitySession;
use crate::ports::store::{DocumentStore, FieldPath, StoreError, Transaction, Write};

const MAX_TITLE_LENGTH: usize = 120;
const MAX_ABOUT_LENGTH: usize = 2_000;
const MAX_TECH_TAGS: usize = 20;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Active,
    Completed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationProject {
    #[serde(default)]
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub about: String,
    #[serde(default)]
    pub tech: Vec<String>,
    #[serde(default)]
    pub github_repo: Option<String>,
    pub creator_id: String,
    #[serde(default)]
    pub collaborators: Vec<String>,
    #[serde(default)]
    pub pending_invites: Vec<String>,
    pub status: ProjectStatus,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default, rename = "createdAt")]
    pub created_at_ms: i64,
    #[serde(default, rename = "updatedAt")]
    pub updated_at_ms: i64,
}

impl Identified for CollaborationProject {
    fn assign_id(&mut self, id: &str) {
        if self.project_id.is_empty() {
            self.project_id = id.to_string();
        }
    }
}

impl CollaborationProject {
    /// Creator first, then collaborators in the order they joined.
    pub fn members(&self) -> Vec<String> {
        let mut members = vec![self.creator_id.clone()];
        members.extend(
            self.collaborators
                .iter()
                .filter(|collaborator| **collaborator != self.creator_id)
                .cloned(),
        );
        members
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProjectCreate {
    pub title: String,
    pub about: String,
    pub tech: Vec<String>,
    pub github_repo: Option<String>,
}

#[derive(Clone)]
pub struct ProjectService {
    store: Arc<dyn DocumentStore>,
    chats: ChatService,
}

impl ProjectService {
    pub fn new(store: Arc<dyn DocumentStore>, chats: ChatService) -> Self {
        Self { store, chats }
    }

    pub async fn create_project(
        &self,
        actor: &IdentitySession,
        input: ProjectCreate,
    ) -> DomainResult<CollaborationProject> {
        let input = validate_project_create(input)?;
        let mut project = CollaborationProject {
            project_id: crate::util::uuid_v7_without_dashes(),
            title: input.title,
            about: input.about,
            tech: input.tech,
            github_repo: input.github_repo,
            creator_id: actor.user_id.clone(),
            collaborators: Vec::new(),
            pending_invites: Vec::new(),
            status: ProjectStatus::Pending,
            chat_id: None,
            created_at_ms: 0,
            updated_at_ms: 0,
        };
        let path = project_path(&project.project_id);
        let receipt = self
            .store
            .commit(
                Transaction::new().require_missing(path.clone()).write(
                    Write::set(path, &project)?
                        .with_server_timestamp("createdAt")
                        .with_server_timestamp("updatedAt"),
                ),
            )
            .await?;
        project.created_at_ms = receipt.commit_time_ms;
        project.updated_at_ms = receipt.commit_time_ms;
        tracing::info!(project_id = %project.project_id, "project created");
        Ok(project)
    }

    pub async fn get_project(&self, project_id: &str) -> DomainResult<CollaborationProject> {
        documents::load(self.store.as_ref(), &project_path(project_id))
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("project {project_id}")))
    }

    pub async fn invite_collaborator(
        &self,
        actor: &IdentitySession,
        project_id: &str,
        invitee_id: &str,
    ) -> DomainResult<CollaborationProject> {
        let mut project = self.get_project(project_id).await?;
        ensure_creator(&project, actor)?;
        ensure_open(&project)?;

        let invitee_id = invitee_id.trim();
        if invitee_id.is_empty() {
            return Err(DomainError::InvalidArgument("invitee_id is required".into()));
        }
        if invitee_id == project.creator_id
            || project.collaborators.iter().any(|id| id == invitee_id)
        {
            return Err(DomainError::InvalidArgument(
                "user is already part of the project".into(),
            ));
        }
        if project.pending_invites.iter().any(|id| id == invitee_id) {
            return Ok(project);
        }

        project.pending_invites.push(invitee_id.to_string());
        let fields = vec![(FieldPath::new("pendingInvites"), json!(project.pending_invites))];
        self.save(&mut project, fields).await?;
        tracing::info!(project_id, invitee_id, "collaborator invited");
        Ok(project)
    }

    /// Moves the invitee into the collaborators and into the project's group chat,
    /// creating that chat on the first acceptance.
    pub async fn accept_invite(
        &self,
        actor: &IdentitySession,
        project_id: &str,
    ) -> DomainResult<CollaborationProject> {
        let mut project = self.get_project(project_id).await?;
        ensure_open(&project)?;
        if !project.pending_invites.iter().any(|id| *id == actor.user_id) {
            return Err(DomainError::Unauthorized(
                "no pending invite for this user".into(),
            ));
        }

        project.pending_invites.retain(|id| *id != actor.user_id);
        project.collaborators.push(actor.user_id.clone());
        project.status = ProjectStatus::Active;
        let fields = vec![
            (FieldPath::new("pendingInvites"), json!(project.pending_invites)),
            (FieldPath::new("collaborators"), json!(project.collaborators)),
            (FieldPath::new("status"), json!(project.status)),
        ];
        self.save(&mut project, fields).await?;

        let creator = IdentitySession::with_user_id(project.creator_id.clone());
        match project.chat_id.clone() {
            Some(chat_id) => {
                self.chats
                    .add_group_members(&creator, &chat_id, vec![actor.user_id.clone()])
                    .await?;
            }
            None => self.attach_group_chat(&creator, &mut project).await?,
        }

        tracing::info!(project_id, user_id = %actor.user_id, "project invite accepted");
        Ok(project)
    }

    pub async fn complete_project(
        &self,
        actor: &IdentitySession,
        project_id: &str,
    ) -> DomainResult<CollaborationProject> {
        let mut project = self.get_project(project_id).await?;
        ensure_creator(&project, actor)?;
        if project.status == ProjectStatus::Completed {
            return Ok(project);
        }
        project.status = ProjectStatus::Completed;
        let fields = vec![(FieldPath::new("status"), json!(project.status))];
        self.save(&mut project, fields).await?;
        Ok(project)
    }

    async fn attach_group_chat(
        &self,
        creator: &IdentitySession,
        project: &mut CollaborationProject,
    ) -> DomainResult<()> {
        let chat = self
            .chats
            .create_group_chat(
                creator,
                GroupChatCreate {
                    name: project.title.clone(),
                    description: project.about.clone(),
                    avatar: None,
                    member_ids: project.members(),
                },
            )
            .await?;

        let path = project_path(&project.project_id);
        let linked = self
            .store
            .commit(
                Transaction::new()
                    .require_field(path.clone(), "chatId", Value::Null)
                    .write(
                        Write::update(path, vec![(FieldPath::new("chatId"), json!(chat.chat_id))])
                            .with_server_timestamp("updatedAt"),
                    ),
            )
            .await;
        match linked {
            Ok(receipt) => {
                project.chat_id = Some(chat.chat_id);
                project.updated_at_ms = receipt.commit_time_ms;
                Ok(())
            }
            Err(StoreError::PreconditionFailed(_)) => {
                // Another acceptance linked its chat first; join that one and hide ours.
                let current = self.get_project(&project.project_id).await?;
                if let Err(err) = self.chats.set_chat_active(creator, &chat.chat_id, false).await {
                    tracing::warn!(chat_id = %chat.chat_id, error = %err, "failed to hide duplicate project chat");
                }
                if let Some(chat_id) = current.chat_id.clone() {
                    self.chats
                        .add_group_members(creator, &chat_id, project.members())
                        .await?;
                }
                *project = current;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Writes `fields` guarded by the `updated_at_ms` the project was read with.
    async fn save(
        &self,
        project: &mut CollaborationProject,
        fields: Vec<(FieldPath, Value)>,
    ) -> DomainResult<()> {
        let path = project_path(&project.project_id);
        let receipt = self
            .store
            .commit(
                Transaction::new()
                    .require_field(path.clone(), "updatedAt", json!(project.updated_at_ms))
                    .write(Write::update(path, fields).with_server_timestamp("updatedAt")),
            )
            .await
            .map_err(|err| match err {
                StoreError::PreconditionFailed(_) => DomainError::TransactionFailed(format!(
                    "project {} was modified concurrently",
                    project.project_id
                )),
                other => other.into(),
            })?;
        project.updated_at_ms = receipt.commit_time_ms;
        Ok(())
    }
}

fn ensure_creator(project: &CollaborationProject, actor: &IdentitySession) -> DomainResult<()> {
    if project.creator_id == actor.user_id {
        Ok(())
    } else {
        Err(DomainError::Unauthorized(
            "only the project creator can do this".into(),
        ))
    }
}

fn ensure_open(project: &CollaborationProject) -> DomainResult<()> {
    if project.status == ProjectStatus::Completed {
        return Err(DomainError::InvalidArgument("project is completed".into()));
    }
    Ok(())
}

fn validate_project_create(mut input: ProjectCreate) -> DomainResult<ProjectCreate> {
    input.title = input.title.trim().to_string();
    input.about = input.about.trim().to_string();
    input.github_repo = input
        .github_repo
        .map(|repo| repo.trim().to_string())
        .filter(|repo| !repo.is_empty());
    input.tech = input
        .tech
        .into_iter()
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect();
    input.tech.dedup();

    if input.title.is_empty() {
        return Err(DomainError::InvalidArgument("title is required".into()));
    }
    if input.title.chars().count() > MAX_TITLE_LENGTH {
        return Err(DomainError::InvalidArgument(format!(
            "title exceeds max length of {MAX_TITLE_LENGTH}"
        )));
    }
    if input.about.chars().count() > MAX_ABOUT_LENGTH {
        return Err(DomainError::InvalidArgument(format!(
            "about exceeds max length of {MAX_ABOUT_LENGTH}"
        )));
    }
    if input.tech.len() > MAX_TECH_TAGS {
        return Err(DomainError::InvalidArgument(format!(
            "at most {MAX_TECH_TAGS} tech tags are allowed"
        )));
    }
    if let Some(repo) = &input.github_repo {
        if !repo.starts_with("https://github.com/") {
            return Err(DomainError::InvalidArgument(
                "github_repo must be a https://github.com/ url".into(),
            ));
        }
    }
    Ok(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatSettings, ChatType, GroupRole};
    use crate::memory_store::InMemoryDocumentStore;

    const ALICE: &str = "user-alice";
    const BOB: &str = "user-bobby";
    const CAROL: &str = "user-carol";

    fn services() -> (ChatService, ProjectService) {
        let store = Arc::new(InMemoryDocumentStore::new());
        let chats = ChatService::new(store.clone(), ChatSettings::default());
        (chats.clone(), ProjectService::new(store, chats))
    }

    fn project_input() -> ProjectCreate {
        ProjectCreate {
            title: "Trail Map".to_string(),
            about: "Offline hiking maps".to_string(),
            tech: vec!["rust".to_string(), " ".to_string()],
            github_repo: Some("https://github.com/example/trail-map".to_string()),
        }
    }

    #[tokio::test]
    async fn accepted_invites_share_one_group_chat() {
        let (chats, projects) = services();
        let alice = IdentitySession::with_user_id(ALICE);
        let bob = IdentitySession::with_user_id(BOB);
        let carol = IdentitySession::with_user_id(CAROL);

        let project = projects.create_project(&alice, project_input()).await.expect("create");
        assert_eq!(project.tech, vec!["rust"]);
        projects
            .invite_collaborator(&alice, &project.project_id, BOB)
            .await
            .expect("invite bob");
        projects
            .invite_collaborator(&alice, &project.project_id, CAROL)
            .await
            .expect("invite carol");

        let project = projects
            .accept_invite(&bob, &project.project_id)
            .await
            .expect("bob accepts");
        assert_eq!(project.status, ProjectStatus::Active);
        let chat_id = project.chat_id.clone().expect("group chat");

        let project = projects
            .accept_invite(&carol, &project.project_id)
            .await
            .expect("carol accepts");
        assert_eq!(project.chat_id.as_deref(), Some(chat_id.as_str()));
        assert!(project.pending_invites.is_empty());

        let chat = chats.get_chat(&carol, &chat_id).await.expect("chat");
        assert_eq!(chat.chat_type, ChatType::Group);
        assert_eq!(chat.participants, vec![ALICE, BOB, CAROL]);
        assert_eq!(chat.role_of(ALICE), Some(GroupRole::Admin));
        assert_eq!(chat.metadata.expect("metadata").name, "Trail Map");
    }

    #[tokio::test]
    async fn only_creator_invites_and_completes() {
        let (_, projects) = services();
        let alice = IdentitySession::with_user_id(ALICE);
        let bob = IdentitySession::with_user_id(BOB);
        let project = projects.create_project(&alice, project_input()).await.expect("create");

        let err = projects
            .invite_collaborator(&bob, &project.project_id, CAROL)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Unauthorized(_)));
        let err = projects.accept_invite(&bob, &project.project_id).await.unwrap_err();
        assert!(matches!(err, DomainError::Unauthorized(_)));

        let completed = projects
            .complete_project(&alice, &project.project_id)
            .await
            .expect("complete");
        assert_eq!(completed.status, ProjectStatus::Completed);
        let err = projects
            .invite_collaborator(&alice, &project.project_id, BOB)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_non_github_repo() {
        let err = validate_project_create(ProjectCreate {
            github_repo: Some("https://example.com/repo".to_string()),
            ..project_input()
        })
        .unwrap_err();
        assert!(matches!(err, DomainError::InvalidArgument(_)));
    }
}

use std::sync::Arc;

use huddle_domain::chat::ChatService;
use huddle_domain::idempotency::IdempotencyService;
use huddle_domain::inbox::InboxService;
use huddle_domain::ports::idempotency::IdempotencyStore;
use huddle_domain::ports::store::DocumentStore;
use huddle_domain::profiles::ProfileService;
use huddle_domain::projects::ProjectService;
use huddle_domain::requests::RequestService;
use huddle_infra::backend::Backends;
use huddle_infra::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub idempotency: IdempotencyService,
    pub chats: ChatService,
    pub inbox: InboxService,
    pub requests: RequestService,
    pub profiles: ProfileService,
    pub projects: ProjectService,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let backends = Backends::connect(&config).await?;
        Ok(Self::with_stores(
            config,
            backends.documents,
            backends.idempotency,
        ))
    }

    pub fn with_stores(
        config: AppConfig,
        documents: Arc<dyn DocumentStore>,
        idempotency: Arc<dyn IdempotencyStore>,
    ) -> Self {
        let settings = config.chat_settings();
        let chats = ChatService::new(documents.clone(), settings.clone());
        let profiles = ProfileService::new(documents.clone());
        Self {
            idempotency: IdempotencyService::new(idempotency, config.idempotency_config()),
            inbox: InboxService::new(documents.clone(), settings),
            requests: RequestService::new(documents.clone(), chats.clone(), profiles.clone()),
            projects: ProjectService::new(documents, chats.clone()),
            chats,
            profiles,
            config,
        }
    }
}

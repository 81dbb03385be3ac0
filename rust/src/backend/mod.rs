// Collaborator contracts consumed by the core, plus the shipped implementations.

mod memory;
mod realtime_ws;
mod rest;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use flume::Sender;

use crate::core::AppConfig;
use crate::error::BackendError;
use crate::state::{Group, MediaType, MessageRow, Profile};

pub use memory::MemoryHub;
pub use realtime_ws::WsTransport;
pub use rest::RestBackend;

/// Persistence/query backend: groups, memberships, messages, profiles.
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    /// `Ok(None)` means the group does not exist.
    async fn fetch_group_info(&self, group_id: &str) -> Result<Option<Group>, BackendError>;

    /// Most recent page, ascending by `created_at`.
    async fn fetch_messages(
        &self,
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRow>, BackendError>;

    async fn fetch_user_profiles(&self, ids: &[String]) -> Result<Vec<Profile>, BackendError>;

    async fn get_user_profile(&self, user_id: &str) -> Result<Profile, BackendError>;

    /// Groups the user belongs to.
    async fn fetch_memberships(&self, user_id: &str) -> Result<Vec<Group>, BackendError>;

    /// Returns the inserted row when the backend hands it back.
    async fn persist_text_message(
        &self,
        group_id: &str,
        user_id: &str,
        content: &str,
    ) -> Result<Option<MessageRow>, BackendError>;

    async fn persist_media_message(
        &self,
        group_id: &str,
        user_id: &str,
        url: &str,
        media_type: MediaType,
    ) -> Result<Option<MessageRow>, BackendError>;
}

#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub bytes: Vec<u8>,
    pub media_type: MediaType,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
}

impl MediaUpload {
    pub fn content_type(&self) -> &str {
        self.mime_type
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.media_type.default_mime_type())
    }

    pub fn extension(&self) -> &str {
        self.filename
            .as_deref()
            .and_then(|f| f.rsplit_once('.'))
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| self.media_type.default_extension())
    }
}

/// Blob store; returns a stable public URL.
#[async_trait]
pub trait MediaStorage: Send + Sync + 'static {
    async fn upload_media(&self, upload: MediaUpload, owner_id: &str)
        -> Result<String, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// One group's message inserts.
    Group { group_id: String },
    /// Membership rows of one user.
    Memberships { user_id: String },
    /// Message inserts fanned out to one user, across all of their groups.
    Inbox { user_id: String },
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group { group_id } => write!(f, "group:{group_id}"),
            Self::Memberships { user_id } => write!(f, "memberships:{user_id}"),
            Self::Inbox { user_id } => write!(f, "inbox:{user_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    MessageInserted(MessageRow),
    MembershipChanged { user_id: String, group_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub topic: Topic,
}

/// Push transport. Delivery is in order per topic and at-least-once.
#[async_trait]
pub trait RealtimeTransport: Send + Sync + 'static {
    async fn subscribe(
        &self,
        topic: Topic,
        sink: Sender<RealtimeEvent>,
    ) -> Result<SubscriptionHandle, BackendError>;

    /// Stops delivery; the sink is dropped. Unknown handles are ignored.
    async fn unsubscribe(&self, handle: SubscriptionHandle);
}

#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn ChatBackend>,
    pub media: Arc<dyn MediaStorage>,
    pub transport: Arc<dyn RealtimeTransport>,
}

impl Collaborators {
    pub fn in_memory(hub: MemoryHub) -> Self {
        let hub = Arc::new(hub);
        Self {
            backend: hub.clone(),
            media: hub.clone(),
            transport: hub,
        }
    }

    /// REST backend + websocket transport from `cognito_config.json`.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let backend_url = config
            .backend_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("backend_url missing from config"))?;
        let api_key = config.api_key.clone().unwrap_or_default();

        let rest = Arc::new(RestBackend::new(
            backend_url,
            api_key.clone(),
            config.access_token.clone(),
            config.media_bucket(),
        )?);

        let realtime_url = match config.realtime_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => realtime_ws::default_realtime_url(backend_url)?,
        };
        let transport = WsTransport::new(&realtime_url, api_key)?
            .with_access_token(config.access_token.clone())
            .with_global_inbox_fallback(config.global_inbox_fallback.unwrap_or(false));

        Ok(Self {
            backend: rest.clone(),
            media: rest,
            transport: Arc::new(transport),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_prefers_explicit_mime_and_filename_extension() {
        let upload = MediaUpload {
            bytes: vec![1, 2, 3],
            media_type: MediaType::Image,
            mime_type: Some("image/png".into()),
            filename: Some("cat.photo.png".into()),
        };
        assert_eq!(upload.content_type(), "image/png");
        assert_eq!(upload.extension(), "png");
    }

    #[test]
    fn upload_falls_back_to_media_type_defaults() {
        let upload = MediaUpload {
            bytes: vec![],
            media_type: MediaType::Audio,
            mime_type: Some(" ".into()),
            filename: Some("noext".into()),
        };
        assert_eq!(upload.content_type(), "audio/webm");
        assert_eq!(upload.extension(), "webm");
    }
}

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SendError;

pub const UNKNOWN_USER: &str = "Unknown User";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Gif,
    Audio,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Gif => "gif",
            Self::Audio => "audio",
        }
    }

    /// Fallback file extension and MIME type when the caller gives none.
    pub fn default_extension(&self) -> &'static str {
        match self {
            Self::Image => "jpg",
            Self::Gif => "gif",
            Self::Audio => "webm",
        }
    }

    pub fn default_mime_type(&self) -> &'static str {
        match self {
            Self::Image => "image/jpeg",
            Self::Gif => "image/gif",
            Self::Audio => "audio/webm",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = SendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" => Ok(Self::Image),
            "gif" => Ok(Self::Gif),
            "audio" => Ok(Self::Audio),
            _ => Err(SendError::UnsupportedMediaType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Profile {
    /// Stand-in used when a profile lookup fails; never blocks rendering.
    pub fn unknown(id: &str) -> Self {
        Self {
            id: id.to_string(),
            username: UNKNOWN_USER.to_string(),
            avatar_url: None,
        }
    }

    pub fn display_name(&self) -> &str {
        let name = self.username.trim();
        if name.is_empty() {
            UNKNOWN_USER
        } else {
            name
        }
    }
}

/// Row shape shared by the query backend and the realtime feeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub group_id: String,
    pub user_id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_type: Option<MediaType>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Pending { temp_id: String },
    Confirmed { server_id: String },
}

impl MessageKey {
    pub fn id(&self) -> &str {
        match self {
            Self::Pending { temp_id } => temp_id,
            Self::Confirmed { server_id } => server_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAttachment {
    pub url: String,
    pub media_type: MediaType,
}

/// Text, media, or media with a caption. A message with neither cannot be built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text {
        content: String,
    },
    Media {
        media: MediaAttachment,
        caption: Option<String>,
    },
}

impl MessageBody {
    /// Normalizes raw row fields. Blank content is treated as absent; a media url
    /// without a type is treated as an image.
    pub fn from_parts(
        content: Option<String>,
        media_url: Option<String>,
        media_type: Option<MediaType>,
    ) -> Option<Self> {
        let content = content.filter(|c| !c.trim().is_empty());
        let media_url = media_url.filter(|u| !u.trim().is_empty());
        match (content, media_url) {
            (caption, Some(url)) => Some(Self::Media {
                media: MediaAttachment {
                    url,
                    media_type: media_type.unwrap_or(MediaType::Image),
                },
                caption,
            }),
            (Some(content), None) => Some(Self::Text { content }),
            (None, None) => None,
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Text { content } => Some(content),
            Self::Media { caption, .. } => caption.as_deref(),
        }
    }

    pub fn media(&self) -> Option<&MediaAttachment> {
        match self {
            Self::Text { .. } => None,
            Self::Media { media, .. } => Some(media),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub key: MessageKey,
    pub group_id: String,
    pub author_id: String,
    pub author_name: String,
    pub author_avatar: Option<String>,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn pending(
        temp_id: String,
        group_id: String,
        author: &Profile,
        body: MessageBody,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key: MessageKey::Pending { temp_id },
            group_id,
            author_id: author.id.clone(),
            author_name: author.display_name().to_string(),
            author_avatar: author.avatar_url.clone(),
            body,
            created_at,
        }
    }

    /// Confirmed message from a persisted row. `None` when the row carries neither
    /// content nor media.
    pub fn from_row(row: MessageRow, author: &Profile) -> Option<Self> {
        let Some(body) = MessageBody::from_parts(row.content, row.media_url, row.media_type) else {
            tracing::warn!(message_id = %row.id, "dropping message row without content or media");
            return None;
        };
        Some(Self {
            key: MessageKey::Confirmed { server_id: row.id },
            group_id: row.group_id,
            author_id: row.user_id,
            author_name: author.display_name().to_string(),
            author_avatar: author.avatar_url.clone(),
            body,
            created_at: row.created_at,
        })
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.key, MessageKey::Pending { .. })
    }

    pub fn content(&self) -> Option<&str> {
        self.body.content()
    }

    pub fn media_url(&self) -> Option<&str> {
        self.body.media().map(|m| m.url.as_str())
    }

    pub fn media_type(&self) -> Option<MediaType> {
        self.body.media().map(|m| m.media_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    LoggedOut,
    LoggedIn { user_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupLoadState {
    Loading,
    Loaded,
    NotFound,
    /// Initial fetch failed; the group stays active with an empty list.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentGroupState {
    pub group_id: String,
    pub group: Option<Group>,
    pub load: GroupLoadState,
    /// Topic subscription is open.
    pub live: bool,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSummary {
    pub group_id: String,
    pub name: String,
    pub description: Option<String>,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusyState {
    pub loading_group: bool,
    pub sends_in_flight: u32,
    pub uploading_media: u32,
}

impl BusyState {
    pub fn is_sending(&self) -> bool {
        self.sends_in_flight > 0 || self.uploading_media > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppState {
    pub rev: u64,
    pub auth: AuthState,
    pub my_profile: Option<Profile>,
    pub current_group: Option<CurrentGroupState>,
    pub groups: Vec<GroupSummary>,
    pub busy: BusyState,
    pub toast: Option<String>,
}

impl AppState {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            auth: AuthState::LoggedOut,
            my_profile: None,
            current_group: None,
            groups: vec![],
            busy: BusyState::default(),
            toast: None,
        }
    }

    pub fn current_messages(&self) -> &[ChatMessage] {
        self.current_group
            .as_ref()
            .map(|g| g.messages.as_slice())
            .unwrap_or(&[])
    }

    pub fn unread_count(&self, group_id: &str) -> u32 {
        self.groups
            .iter()
            .find(|g| g.group_id == group_id)
            .map(|g| g.unread_count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(content: Option<&str>, media_url: Option<&str>) -> MessageRow {
        MessageRow {
            id: "m1".into(),
            group_id: "g1".into(),
            user_id: "u1".into(),
            content: content.map(ToString::to_string),
            media_url: media_url.map(ToString::to_string),
            media_type: media_url.map(|_| MediaType::Gif),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn row_without_content_or_media_is_rejected() {
        let author = Profile::unknown("u1");
        assert!(ChatMessage::from_row(row(None, None), &author).is_none());
        assert!(ChatMessage::from_row(row(Some("   "), None), &author).is_none());
    }

    #[test]
    fn empty_content_next_to_media_is_no_caption() {
        let msg = ChatMessage::from_row(row(Some(""), Some("https://cdn/x.gif")), &Profile::unknown("u1"))
            .expect("media row");
        assert_eq!(msg.content(), None);
        assert_eq!(msg.media_url(), Some("https://cdn/x.gif"));
        assert_eq!(msg.media_type(), Some(MediaType::Gif));
        assert!(!msg.is_pending());
    }

    #[test]
    fn media_type_parses_known_kinds_only() {
        assert_eq!("IMAGE".parse::<MediaType>(), Ok(MediaType::Image));
        assert_eq!(" gif ".parse::<MediaType>(), Ok(MediaType::Gif));
        assert_eq!("audio".parse::<MediaType>(), Ok(MediaType::Audio));
        assert!(matches!(
            "video".parse::<MediaType>(),
            Err(SendError::UnsupportedMediaType(t)) if t == "video"
        ));
    }

    #[test]
    fn blank_username_displays_as_unknown() {
        let p = Profile {
            id: "u1".into(),
            username: "  ".into(),
            avatar_url: None,
        };
        assert_eq!(p.display_name(), UNKNOWN_USER);
    }

    #[test]
    fn media_row_json_uses_lowercase_type() {
        let json = serde_json::json!({
            "id": "m9",
            "group_id": "g1",
            "user_id": "u2",
            "content": null,
            "media_url": "https://cdn/a.ogg",
            "media_type": "audio",
            "created_at": "2024-05-01T10:00:00Z"
        });
        let row: MessageRow = serde_json::from_value(json).expect("row");
        assert_eq!(row.media_type, Some(MediaType::Audio));
    }
}

use crate::backend::SubscriptionHandle;
use crate::error::{FetchError, PersistError, SendError, SubscriptionError, UploadError};
use crate::state::{AppState, ChatMessage, Group, MediaType, MessageRow, Profile};
use crate::AppAction;

#[derive(Clone, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum AppUpdate {
    /// Primary update stream: always a full state snapshot.
    FullState(AppState),
    /// A send was rolled back or never started. `temp_id` names the removed optimistic entry.
    SendFailed {
        rev: u64,
        temp_id: Option<String>,
        error: SendError,
    },
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
            AppUpdate::SendFailed { rev, .. } => *rev,
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
}

#[derive(Debug)]
pub enum InternalEvent {
    // Session feeds
    ProfileResolved {
        session_token: u64,
        profile: Profile,
    },
    MembershipsLoaded {
        session_token: u64,
        result: Result<Vec<Group>, FetchError>,
    },
    MembershipsChanged {
        session_token: u64,
    },
    InboxMessage {
        session_token: u64,
        group_id: String,
        author_id: String,
    },
    FeedOpened {
        session_token: u64,
        result: Result<SubscriptionHandle, SubscriptionError>,
    },

    // Active group
    GroupLoaded {
        token: u64,
        group_id: String,
        result: Result<(Group, Vec<ChatMessage>), FetchError>,
    },
    SubscriptionOpened {
        token: u64,
        group_id: String,
        result: Result<SubscriptionHandle, SubscriptionError>,
    },
    GroupMessageReceived {
        token: u64,
        message: ChatMessage,
    },

    // Send results
    MediaUploaded {
        session_token: u64,
        group_id: String,
        media_type: MediaType,
        result: Result<String, UploadError>,
    },
    PersistResult {
        session_token: u64,
        group_id: String,
        temp_id: String,
        result: Result<Option<MessageRow>, PersistError>,
    },

    ToastAutoDismiss {
        token: u64,
    },
}

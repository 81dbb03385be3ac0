use std::time::Duration;

/// Failure reported by a collaborator (query backend, media storage, realtime transport).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout;
        }
        if e.is_decode() {
            return Self::Decode(e.to_string());
        }
        if let Some(status) = e.status() {
            return Self::Rejected {
                status: status.as_u16(),
                message: e.to_string(),
            };
        }
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// Group, message page or profile load failure. Recovered locally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("group not found: {0}")]
    GroupNotFound(String),
    #[error("fetch failed: {0}")]
    Backend(#[from] BackendError),
}

/// Realtime subscription could not be opened. Logged, never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("subscription to {topic} failed: {source}")]
pub struct SubscriptionError {
    pub topic: String,
    #[source]
    pub source: BackendError,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error("media upload rejected: {0}")]
    Rejected(BackendError),
    #[error("media upload timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("message persist failed: {0}")]
pub struct PersistError(pub BackendError);

/// Why a user-initiated send did not go through.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("no active group")]
    NoActiveGroup,
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl SendError {
    /// Short notice for the toast line.
    pub fn user_notice(&self) -> &'static str {
        match self {
            Self::NotLoggedIn => "Please log in first",
            Self::NoActiveGroup => "Select a group to send messages.",
            Self::UnsupportedMediaType(_) => "Unsupported media type.",
            Self::Upload(_) => "Failed to upload media.",
            Self::Persist(_) => "Failed to send message.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_error_wraps_upload_and_persist_failures() {
        let err: SendError = UploadError::Timeout(Duration::from_secs(30)).into();
        assert_eq!(err.user_notice(), "Failed to upload media.");
        assert!(err.to_string().contains("timed out"));

        let err: SendError = PersistError(BackendError::Rejected {
            status: 409,
            message: "conflict".into(),
        })
        .into();
        assert_eq!(err.user_notice(), "Failed to send message.");
        assert!(err.to_string().contains("409"));
    }

    #[test]
    fn subscription_error_names_the_topic() {
        let err = SubscriptionError {
            topic: "group:g1".into(),
            source: BackendError::Transport("connection refused".into()),
        };
        let text = err.to_string();
        assert!(text.contains("group:g1"), "got: {text}");
        assert!(text.contains("connection refused"), "got: {text}");
    }
}

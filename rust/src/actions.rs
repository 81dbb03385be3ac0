#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    // Session
    Login {
        user_id: String,
    },
    Logout,

    // Groups
    ActivateGroup {
        /// `None` leaves the current group without opening another.
        group_id: Option<String>,
    },

    // Sending
    SendText {
        content: String,
    },
    SendMedia {
        data: Vec<u8>,
        media_type: String,
        mime_type: Option<String>,
        filename: Option<String>,
    },

    // UI
    ClearToast,
}

impl AppAction {
    /// Log-safe name. Message content and media bytes never reach the log.
    pub fn tag(&self) -> &'static str {
        match self {
            AppAction::Login { .. } => "Login",
            AppAction::Logout => "Logout",
            AppAction::ActivateGroup { .. } => "ActivateGroup",
            AppAction::SendText { .. } => "SendText",
            AppAction::SendMedia { .. } => "SendMedia",
            AppAction::ClearToast => "ClearToast",
        }
    }
}

// Optimistic sends: entry first, persist in the background, reconcile or roll back.

use chrono::Utc;

use super::*;

use crate::backend::MediaUpload;
use crate::error::{PersistError, UploadError};
use crate::state::{ChatMessage, MediaAttachment, MediaType, MessageBody, MessageRow, Profile};

enum PersistRequest {
    Text { content: String },
    Media { url: String, media_type: MediaType },
}

fn new_temp_id() -> String {
    format!("temp-{}", uuid::Uuid::new_v4())
}

impl AppCore {
    /// Own profile for optimistic entries; the stand-in until the prefetch lands.
    fn sender_profile(&self, user_id: &str) -> Profile {
        self.profiles
            .peek(user_id)
            .unwrap_or_else(|| Profile::unknown(user_id))
    }

    /// Session user and active group, or the reason a send cannot start.
    fn send_target(&self) -> Result<(String, String), SendError> {
        let user_id = self.session_user_id().ok_or(SendError::NotLoggedIn)?;
        let group_id = self.active_group_id().ok_or(SendError::NoActiveGroup)?;
        Ok((user_id.to_string(), group_id.to_string()))
    }

    fn fail_send(&mut self, temp_id: Option<String>, error: SendError) {
        self.toast(error.user_notice());
        self.emit_send_failed(temp_id, error);
    }

    pub(super) fn send_text(&mut self, content: String) {
        let content = content.trim();
        if content.is_empty() {
            return;
        }
        let (user_id, group_id) = match self.send_target() {
            Ok(target) => target,
            Err(e) => {
                self.fail_send(None, e);
                return;
            }
        };

        let temp_id = new_temp_id();
        let author = self.sender_profile(&user_id);
        let body = MessageBody::Text {
            content: content.to_string(),
        };
        self.outgoing.insert(temp_id.clone(), body.clone());
        let pending =
            ChatMessage::pending(temp_id.clone(), group_id.clone(), &author, body, Utc::now());
        self.store.append(pending);
        self.state.busy.sends_in_flight += 1;
        self.sync_current_messages();
        self.emit_state();
        tracing::info!(%group_id, %temp_id, "send_text");

        let request = PersistRequest::Text {
            content: content.to_string(),
        };
        self.spawn_persist(user_id, group_id, temp_id, request);
    }

    pub(super) fn send_media(
        &mut self,
        data: Vec<u8>,
        media_type: String,
        mime_type: Option<String>,
        filename: Option<String>,
    ) {
        let media_type: MediaType = match media_type.parse() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(%e, "send_media rejected");
                self.fail_send(None, e);
                return;
            }
        };
        let (user_id, group_id) = match self.send_target() {
            Ok(target) => target,
            Err(e) => {
                self.fail_send(None, e);
                return;
            }
        };

        self.state.busy.uploading_media += 1;
        self.emit_state();
        tracing::info!(%group_id, %media_type, bytes = data.len(), "send_media upload");

        let media = self.collaborators.media.clone();
        let timeout = self.config.upload_timeout();
        let session_token = self.session_token;
        let tx = self.core_sender.clone();
        let upload = MediaUpload {
            bytes: data,
            media_type,
            mime_type,
            filename,
        };
        self.runtime.spawn(async move {
            let result = match tokio::time::timeout(timeout, media.upload_media(upload, &user_id))
                .await
            {
                Ok(Ok(url)) => Ok(url),
                Ok(Err(e)) => Err(UploadError::Rejected(e)),
                Err(_) => Err(UploadError::Timeout(timeout)),
            };
            Self::send_internal(
                &tx,
                InternalEvent::MediaUploaded {
                    session_token,
                    group_id,
                    media_type,
                    result,
                },
            );
        });
    }

    pub(super) fn handle_media_uploaded(
        &mut self,
        session_token: u64,
        group_id: String,
        media_type: MediaType,
        result: Result<String, UploadError>,
    ) {
        // Busy counters were zeroed with the old session's state.
        if !self.is_current_session(session_token) {
            tracing::debug!(%group_id, "upload result for ended session discarded");
            return;
        }
        self.state.busy.uploading_media = self.state.busy.uploading_media.saturating_sub(1);
        let url = match result {
            Ok(url) => url,
            Err(e) => {
                // Nothing was inserted, so there is nothing to roll back.
                tracing::warn!(%e, %group_id, "media upload failed");
                self.fail_send(None, SendError::Upload(e));
                return;
            }
        };
        let Some(user_id) = self.session_user_id().map(ToString::to_string) else {
            return;
        };

        let temp_id = new_temp_id();
        let body = MessageBody::Media {
            media: MediaAttachment {
                url: url.clone(),
                media_type,
            },
            caption: None,
        };
        self.outgoing.insert(temp_id.clone(), body.clone());
        if self.active_group_id() == Some(group_id.as_str()) {
            let author = self.sender_profile(&user_id);
            let pending =
                ChatMessage::pending(temp_id.clone(), group_id.clone(), &author, body, Utc::now());
            self.store.append(pending);
            self.sync_current_messages();
        } else {
            tracing::info!(%group_id, "group changed during upload; persisting without optimistic entry");
        }
        self.state.busy.sends_in_flight += 1;
        self.emit_state();

        self.spawn_persist(
            user_id,
            group_id,
            temp_id,
            PersistRequest::Media { url, media_type },
        );
    }

    fn spawn_persist(
        &self,
        user_id: String,
        group_id: String,
        temp_id: String,
        request: PersistRequest,
    ) {
        let backend = self.collaborators.backend.clone();
        let session_token = self.session_token;
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let result = match request {
                PersistRequest::Text { content } => {
                    backend
                        .persist_text_message(&group_id, &user_id, &content)
                        .await
                }
                PersistRequest::Media { url, media_type } => {
                    backend
                        .persist_media_message(&group_id, &user_id, &url, media_type)
                        .await
                }
            }
            .map_err(PersistError);
            Self::send_internal(
                &tx,
                InternalEvent::PersistResult {
                    session_token,
                    group_id,
                    temp_id,
                    result,
                },
            );
        });
    }

    /// Removes the optimistic entry of a failed send and returns the id actually removed.
    ///
    /// An echo of an identical send may already have claimed `temp_id` (echoes match the
    /// oldest pending twin). The failed send's copy is then the oldest twin still pending.
    fn roll_back_pending(&mut self, temp_id: &str, body: Option<&MessageBody>) -> Option<String> {
        if self.store.remove_pending(temp_id) {
            return Some(temp_id.to_string());
        }
        let user_id = self.session_user_id()?.to_string();
        let twin = self
            .store
            .find_pending_echo(&user_id, body?)
            .map(ToString::to_string)?;
        tracing::debug!(%temp_id, %twin, "failed send was claimed by an echo; rolling back its twin");
        self.store.remove_pending(&twin);
        Some(twin)
    }

    pub(super) fn handle_persist_result(
        &mut self,
        session_token: u64,
        group_id: String,
        temp_id: String,
        result: Result<Option<MessageRow>, PersistError>,
    ) {
        if !self.is_current_session(session_token) {
            tracing::debug!(%temp_id, "persist result for ended session discarded");
            return;
        }
        self.state.busy.sends_in_flight = self.state.busy.sends_in_flight.saturating_sub(1);
        let body = self.outgoing.remove(&temp_id);
        // After a group switch the old entries are gone; never touch the new list.
        let in_active_group = self.active_group_id() == Some(group_id.as_str());

        match result {
            Ok(Some(row)) => {
                if in_active_group {
                    let author = self.sender_profile(&row.user_id);
                    if let Some(confirmed) = ChatMessage::from_row(row, &author) {
                        if !self.store.replace_pending(&temp_id, confirmed) {
                            tracing::debug!(%temp_id, "pending entry already reconciled");
                        }
                        self.sync_current_messages();
                    }
                }
                self.emit_state();
            }
            // The realtime echo reconciles the entry.
            Ok(None) => self.emit_state(),
            Err(e) => {
                tracing::warn!(%e, %group_id, %temp_id, "persist failed; rolling back");
                let removed = if in_active_group {
                    let removed = self.roll_back_pending(&temp_id, body.as_ref());
                    self.sync_current_messages();
                    removed
                } else {
                    None
                };
                self.fail_send(Some(removed.unwrap_or(temp_id)), SendError::Persist(e));
            }
        }
    }
}

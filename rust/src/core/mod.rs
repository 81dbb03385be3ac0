mod config;
mod message_store;
mod profile_cache;
mod send;
mod session;
mod subscriptions;
mod unread;


use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use flume::Sender;

use crate::actions::AppAction;
use crate::backend::{Collaborators, SubscriptionHandle};
use crate::error::SendError;
use crate::state::{AppState, Group, GroupSummary, MessageBody};
use crate::updates::{AppUpdate, CoreMsg, InternalEvent};

pub use config::{load_app_config, AppConfig, CONFIG_FILE_NAME};
pub(crate) use message_store::MessageStore;
pub(crate) use profile_cache::ProfileCache;
pub(crate) use unread::UnreadTracker;

struct Session {
    user_id: String,
    token: u64,
    alive: Arc<AtomicBool>,
    // membership + inbox feeds
    feeds: Vec<SubscriptionHandle>,
}

struct ActiveGroup {
    group_id: String,
    token: u64,
    // Cleared on teardown; the forwarding task stops at its next event.
    alive: Arc<AtomicBool>,
    subscription: Option<SubscriptionHandle>,
}

pub struct AppCore {
    pub state: AppState,
    rev: u64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<AppState>>,

    config: AppConfig,
    runtime: tokio::runtime::Runtime,
    collaborators: Collaborators,

    session: Option<Session>,
    session_token: u64,

    active: Option<ActiveGroup>,
    activation_token: u64,

    store: MessageStore,
    profiles: ProfileCache,
    unread: UnreadTracker,
    memberships: Vec<Group>,
    // temp id -> body of every send whose persist has not resolved
    outgoing: HashMap<String, MessageBody>,

    toast_dismiss_token: u64,
}

impl AppCore {
    pub fn new(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        data_dir: String,
        shared_state: Arc<RwLock<AppState>>,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        let config = load_app_config(&data_dir);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .enable_io()
            .build()?;

        Ok(Self {
            state: AppState::empty(),
            rev: 0,
            update_sender,
            core_sender,
            shared_state,
            config,
            runtime,
            collaborators,
            session: None,
            session_token: 0,
            active: None,
            activation_token: 0,
            store: MessageStore::new(),
            profiles: ProfileCache::new(),
            unread: UnreadTracker::new(),
            memberships: Vec::new(),
            outgoing: HashMap::new(),
            toast_dismiss_token: 0,
        })
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &AppState) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    fn emit_state(&mut self) {
        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::FullState(snapshot));
    }

    fn emit_send_failed(&mut self, temp_id: Option<String>, error: SendError) {
        let rev = self.next_rev();
        // Keep the shared snapshot's rev in step with the update stream.
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::SendFailed {
            rev,
            temp_id,
            error,
        });
    }

    fn toast(&mut self, msg: impl Into<String>) {
        self.state.toast = Some(msg.into());
        self.toast_dismiss_token = self.toast_dismiss_token.saturating_add(1);
        self.schedule_toast_auto_dismiss(self.toast_dismiss_token);
        self.emit_state();
    }

    fn schedule_toast_auto_dismiss(&self, token: u64) {
        let tx = self.core_sender.clone();
        let delay = self.config.toast_dismiss();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::ToastAutoDismiss { token },
            )));
        });
    }

    fn handle_toast_auto_dismiss(&mut self, token: u64) {
        if token != self.toast_dismiss_token || self.state.toast.is_none() {
            return;
        }
        self.state.toast = None;
        self.emit_state();
    }

    fn send_internal(tx: &Sender<CoreMsg>, event: InternalEvent) {
        let _ = tx.send(CoreMsg::Internal(Box::new(event)));
    }

    fn session_user_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.user_id.as_str())
    }

    fn is_current_session(&self, token: u64) -> bool {
        self.session.as_ref().is_some_and(|s| s.token == token)
    }

    fn active_group_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.group_id.as_str())
    }

    /// Copies the store into the published view of the active group.
    fn sync_current_messages(&mut self) {
        if let Some(cg) = self.state.current_group.as_mut() {
            cg.messages = self.store.snapshot();
        }
    }

    /// Rebuilds the published group list from memberships and unread counters.
    fn sync_groups(&mut self) {
        self.state.groups = self
            .memberships
            .iter()
            .map(|g| GroupSummary {
                group_id: g.id.clone(),
                name: g.name.clone(),
                description: g.description.clone(),
                unread_count: self.unread.count(&g.id),
            })
            .collect();
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Action(action) => {
                // Never log `?action`: it carries message content and media bytes.
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action);
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
        }
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            AppAction::Login { user_id } => self.login(user_id),
            AppAction::Logout => {
                self.stop_session();
                self.emit_state();
            }
            AppAction::ActivateGroup { group_id } => self.activate_group(group_id),
            AppAction::SendText { content } => self.send_text(content),
            AppAction::SendMedia {
                data,
                media_type,
                mime_type,
                filename,
            } => self.send_media(data, media_type, mime_type, filename),
            AppAction::ClearToast => {
                if self.state.toast.take().is_some() {
                    self.emit_state();
                }
            }
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::ProfileResolved {
                session_token,
                profile,
            } => self.handle_profile_resolved(session_token, profile),
            InternalEvent::MembershipsLoaded {
                session_token,
                result,
            } => self.handle_memberships_loaded(session_token, result),
            InternalEvent::MembershipsChanged { session_token } => {
                if self.is_current_session(session_token) {
                    self.refresh_memberships();
                }
            }
            InternalEvent::InboxMessage {
                session_token,
                group_id,
                author_id,
            } => self.handle_inbox_message(session_token, &group_id, &author_id),
            InternalEvent::FeedOpened {
                session_token,
                result,
            } => self.handle_feed_opened(session_token, result),
            InternalEvent::GroupLoaded {
                token,
                group_id,
                result,
            } => self.handle_group_loaded(token, group_id, result),
            InternalEvent::SubscriptionOpened {
                token,
                group_id,
                result,
            } => self.handle_subscription_opened(token, group_id, result),
            InternalEvent::GroupMessageReceived { token, message } => {
                self.handle_group_message(token, message)
            }
            InternalEvent::MediaUploaded {
                session_token,
                group_id,
                media_type,
                result,
            } => self.handle_media_uploaded(session_token, group_id, media_type, result),
            InternalEvent::PersistResult {
                session_token,
                group_id,
                temp_id,
                result,
            } => self.handle_persist_result(session_token, group_id, temp_id, result),
            InternalEvent::ToastAutoDismiss { token } => self.handle_toast_auto_dismiss(token),
        }
    }
}

fn mark_dead(alive: &AtomicBool) {
    alive.store(false, Ordering::SeqCst);
}

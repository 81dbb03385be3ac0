// Group activation: teardown, initial load, topic subscription, inbound routing.

use std::collections::BTreeSet;

use super::*;

use crate::backend::{ChatBackend, RealtimeEvent, Topic};
use crate::error::{FetchError, SubscriptionError};
use crate::state::{ChatMessage, CurrentGroupState, GroupLoadState, Profile};

const LOAD_FAILED_NOTICE: &str = "Failed to load chat data.";
const GROUP_NOT_FOUND_NOTICE: &str = "Group not found";
const LIVE_UNAVAILABLE_NOTICE: &str = "Live updates are unavailable for this group.";

/// Group metadata, then the latest page, then a bulk profile fetch for its authors.
async fn load_group(
    backend: &dyn ChatBackend,
    profiles: &ProfileCache,
    group_id: &str,
    limit: usize,
) -> Result<(Group, Vec<ChatMessage>), FetchError> {
    let group = backend
        .fetch_group_info(group_id)
        .await?
        .ok_or_else(|| FetchError::GroupNotFound(group_id.to_string()))?;
    let rows = backend.fetch_messages(group_id, limit).await?;

    let missing: Vec<String> = rows
        .iter()
        .map(|r| r.user_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|id| profiles.peek(id).is_none())
        .collect();
    if !missing.is_empty() {
        match backend.fetch_user_profiles(&missing).await {
            Ok(found) => profiles.extend(found),
            // Authors render as "Unknown User"; the page itself is still good.
            Err(e) => tracing::warn!(%e, group_id, "bulk profile fetch failed"),
        }
    }

    let messages = rows
        .into_iter()
        .filter_map(|row| {
            let author = profiles
                .peek(&row.user_id)
                .unwrap_or_else(|| Profile::unknown(&row.user_id));
            ChatMessage::from_row(row, &author)
        })
        .collect();
    Ok((group, messages))
}

impl AppCore {
    pub(super) fn activate_group(&mut self, group_id: Option<String>) {
        let group_id = group_id
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty());

        let Some(group_id) = group_id else {
            self.teardown_active_group();
            self.active = None;
            self.store.reset();
            self.state.current_group = None;
            self.state.busy.loading_group = false;
            self.emit_state();
            return;
        };
        if self.session.is_none() {
            self.toast("Please log in first");
            return;
        }

        self.teardown_active_group();
        self.activation_token = self.activation_token.wrapping_add(1);
        let token = self.activation_token;
        tracing::info!(%group_id, token, "activate_group");

        // Both resets happen before the new topic is requested.
        self.store.reset();
        self.unread.reset(&group_id);

        let alive = Arc::new(AtomicBool::new(true));
        self.active = Some(ActiveGroup {
            group_id: group_id.clone(),
            token,
            alive: alive.clone(),
            subscription: None,
        });
        self.state.current_group = Some(CurrentGroupState {
            group_id: group_id.clone(),
            group: None,
            load: GroupLoadState::Loading,
            live: false,
            messages: vec![],
        });
        self.state.busy.loading_group = true;
        self.sync_groups();
        self.emit_state();

        self.spawn_initial_load(token, group_id.clone());
        self.spawn_group_subscription(token, group_id, alive);
    }

    /// Marks the active topic dead and releases its subscription. Leaves `self.active` set.
    pub(super) fn teardown_active_group(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        mark_dead(&active.alive);
        if let Some(handle) = active.subscription.take() {
            tracing::info!(group_id = %active.group_id, "unsubscribe group topic");
            let transport = self.collaborators.transport.clone();
            self.runtime.spawn(async move { transport.unsubscribe(handle).await });
        }
    }

    fn is_current_activation(&self, token: u64, group_id: &str) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.token == token && a.group_id == group_id)
    }

    fn spawn_initial_load(&self, token: u64, group_id: String) {
        let backend = self.collaborators.backend.clone();
        let profiles = self.profiles.clone();
        let limit = self.config.page_size();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let result = load_group(backend.as_ref(), &profiles, &group_id, limit).await;
            Self::send_internal(
                &tx,
                InternalEvent::GroupLoaded {
                    token,
                    group_id,
                    result,
                },
            );
        });
    }

    fn spawn_group_subscription(&self, token: u64, group_id: String, alive: Arc<AtomicBool>) {
        let (sink, events) = flume::unbounded::<RealtimeEvent>();
        let topic = Topic::Group {
            group_id: group_id.clone(),
        };

        let transport = self.collaborators.transport.clone();
        let tx = self.core_sender.clone();
        let gid = group_id.clone();
        self.runtime.spawn(async move {
            let result = transport
                .subscribe(topic.clone(), sink)
                .await
                .map_err(|source| SubscriptionError {
                    topic: topic.to_string(),
                    source,
                });
            Self::send_internal(
                &tx,
                InternalEvent::SubscriptionOpened {
                    token,
                    group_id: gid,
                    result,
                },
            );
        });

        // One task per topic, so author lookups never reorder its events.
        let backend = self.collaborators.backend.clone();
        let profiles = self.profiles.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            while let Ok(event) = events.recv_async().await {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                let RealtimeEvent::MessageInserted(row) = event else {
                    continue;
                };
                if row.group_id != group_id {
                    tracing::debug!(expected = %group_id, got = %row.group_id, "dropping row for another group");
                    continue;
                }
                let author = profiles.get(backend.as_ref(), &row.user_id).await;
                let Some(message) = ChatMessage::from_row(row, &author) else {
                    continue;
                };
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                Self::send_internal(&tx, InternalEvent::GroupMessageReceived { token, message });
            }
            tracing::debug!(%group_id, token, "group forwarding finished");
        });
    }

    pub(super) fn handle_group_loaded(
        &mut self,
        token: u64,
        group_id: String,
        result: Result<(Group, Vec<ChatMessage>), FetchError>,
    ) {
        if !self.is_current_activation(token, &group_id) {
            tracing::debug!(%group_id, token, "stale group load discarded");
            return;
        }
        self.state.busy.loading_group = false;
        match result {
            Ok((group, page)) => {
                let page_len = page.len();
                self.store.load_page(page);
                tracing::info!(%group_id, page = page_len, total = self.store.len(), "group loaded");
                if let Some(cg) = self.state.current_group.as_mut() {
                    cg.group = Some(group);
                    cg.load = GroupLoadState::Loaded;
                }
                self.sync_current_messages();
                self.emit_state();
            }
            Err(FetchError::GroupNotFound(_)) => {
                tracing::warn!(%group_id, "group not found");
                self.store.reset();
                if let Some(cg) = self.state.current_group.as_mut() {
                    cg.load = GroupLoadState::NotFound;
                }
                self.sync_current_messages();
                self.toast(GROUP_NOT_FOUND_NOTICE);
            }
            Err(e) => {
                tracing::warn!(%e, %group_id, "initial load failed");
                if let Some(cg) = self.state.current_group.as_mut() {
                    cg.load = GroupLoadState::Failed;
                }
                self.sync_current_messages();
                self.toast(LOAD_FAILED_NOTICE);
            }
        }
    }

    pub(super) fn handle_subscription_opened(
        &mut self,
        token: u64,
        group_id: String,
        result: Result<SubscriptionHandle, SubscriptionError>,
    ) {
        let current = self.is_current_activation(token, &group_id);
        match result {
            Ok(handle) if current => {
                if let Some(active) = self.active.as_mut() {
                    active.subscription = Some(handle);
                }
                if let Some(cg) = self.state.current_group.as_mut() {
                    cg.live = true;
                }
                self.emit_state();
            }
            Ok(handle) => {
                tracing::debug!(%group_id, token, "releasing subscription of stale activation");
                let transport = self.collaborators.transport.clone();
                self.runtime.spawn(async move { transport.unsubscribe(handle).await });
            }
            Err(e) if current => {
                tracing::warn!(%e, "group subscription failed");
                self.toast(LIVE_UNAVAILABLE_NOTICE);
            }
            Err(e) => tracing::debug!(%e, "stale subscription failure ignored"),
        }
    }

    pub(super) fn handle_group_message(&mut self, token: u64, message: ChatMessage) {
        if !self.is_current_activation(token, &message.group_id) {
            tracing::debug!(id = message.id(), token, "stale group event discarded");
            return;
        }
        if self.store.contains(message.id()) {
            return;
        }
        let echo_of = self
            .store
            .find_pending_echo(&message.author_id, &message.body)
            .map(ToString::to_string);
        match echo_of {
            Some(temp_id) => {
                self.store.replace_pending(&temp_id, message);
            }
            None => {
                self.store.append(message);
            }
        }
        self.sync_current_messages();
        self.emit_state();
    }
}

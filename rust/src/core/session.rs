// Login session: own profile, membership list, and the two per-user feeds.

use super::*;

use crate::backend::{RealtimeEvent, Topic};
use crate::error::{FetchError, SubscriptionError};
use crate::state::{AuthState, Profile};

impl AppCore {
    pub(super) fn login(&mut self, user_id: String) {
        let user_id = user_id.trim().to_string();
        if user_id.is_empty() {
            self.toast("Enter a user id to log in");
            return;
        }

        // Tear down any existing session first.
        self.stop_session();

        self.session_token = self.session_token.wrapping_add(1);
        let token = self.session_token;
        tracing::info!(user_id = %user_id, token, "start_session");

        self.session = Some(Session {
            user_id: user_id.clone(),
            token,
            alive: Arc::new(AtomicBool::new(true)),
            feeds: Vec::new(),
        });
        self.state.auth = AuthState::LoggedIn {
            user_id: user_id.clone(),
        };
        self.emit_state();

        self.prefetch_own_profile(token, user_id.clone());
        self.refresh_memberships();
        self.open_feed(Topic::Memberships {
            user_id: user_id.clone(),
        });
        self.open_feed(Topic::Inbox { user_id });
    }

    /// Drops every piece of session-scoped state. Callers emit.
    pub(super) fn stop_session(&mut self) {
        self.teardown_active_group();
        self.active = None;

        if let Some(sess) = self.session.take() {
            tracing::info!(
                user_id = %sess.user_id,
                cached_profiles = self.profiles.len(),
                "stop_session"
            );
            mark_dead(&sess.alive);
            let transport = self.collaborators.transport.clone();
            let feeds = sess.feeds;
            if !feeds.is_empty() {
                self.runtime.spawn(async move {
                    for handle in feeds {
                        transport.unsubscribe(handle).await;
                    }
                });
            }
        }
        // Invalidate in-flight results of the old session.
        self.session_token = self.session_token.wrapping_add(1);

        tracing::debug!(
            unread_groups = self.unread.counts().len(),
            had_messages = !self.store.is_empty(),
            "clearing session caches"
        );
        self.store.reset();
        self.unread.clear();
        // Lookups still running hold the old map; they must not repopulate the next session's.
        self.profiles.clear();
        self.profiles = ProfileCache::new();
        self.memberships.clear();
        self.outgoing.clear();

        let toast = self.state.toast.take();
        self.state = AppState::empty();
        self.state.rev = self.rev;
        self.state.toast = toast;
    }

    fn prefetch_own_profile(&self, session_token: u64, user_id: String) {
        let backend = self.collaborators.backend.clone();
        let profiles = self.profiles.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let profile = profiles.get(backend.as_ref(), &user_id).await;
            Self::send_internal(
                &tx,
                InternalEvent::ProfileResolved {
                    session_token,
                    profile,
                },
            );
        });
    }

    pub(super) fn handle_profile_resolved(&mut self, session_token: u64, profile: Profile) {
        if !self.is_current_session(session_token) {
            return;
        }
        self.state.my_profile = Some(profile);
        self.emit_state();
    }

    pub(super) fn refresh_memberships(&self) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let session_token = sess.token;
        let user_id = sess.user_id.clone();
        let backend = self.collaborators.backend.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let result = backend
                .fetch_memberships(&user_id)
                .await
                .map_err(FetchError::from);
            Self::send_internal(
                &tx,
                InternalEvent::MembershipsLoaded {
                    session_token,
                    result,
                },
            );
        });
    }

    pub(super) fn handle_memberships_loaded(
        &mut self,
        session_token: u64,
        result: Result<Vec<Group>, FetchError>,
    ) {
        if !self.is_current_session(session_token) {
            return;
        }
        match result {
            Ok(groups) => {
                tracing::info!(count = groups.len(), "memberships loaded");
                let active = self.active_group_id().map(ToString::to_string);
                self.unread
                    .set_memberships(groups.iter().map(|g| g.id.clone()), active.as_deref());
                self.memberships = groups;
                self.sync_groups();
                self.emit_state();
            }
            Err(e) => {
                tracing::warn!(%e, "membership fetch failed");
                self.toast("Failed to load groups.");
            }
        }
    }

    /// Subscribes a per-user feed and forwards its events to the actor.
    fn open_feed(&self, topic: Topic) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let session_token = sess.token;
        let alive = sess.alive.clone();
        let (sink, events) = flume::unbounded::<RealtimeEvent>();

        let transport = self.collaborators.transport.clone();
        let tx = self.core_sender.clone();
        let feed_topic = topic.clone();
        self.runtime.spawn(async move {
            let result = transport
                .subscribe(feed_topic.clone(), sink)
                .await
                .map_err(|source| SubscriptionError {
                    topic: feed_topic.to_string(),
                    source,
                });
            Self::send_internal(
                &tx,
                InternalEvent::FeedOpened {
                    session_token,
                    result,
                },
            );
        });

        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            while let Ok(event) = events.recv_async().await {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                let internal = match event {
                    RealtimeEvent::MembershipChanged { group_id, .. } => {
                        tracing::debug!(%group_id, "membership changed");
                        InternalEvent::MembershipsChanged { session_token }
                    }
                    RealtimeEvent::MessageInserted(row) => InternalEvent::InboxMessage {
                        session_token,
                        group_id: row.group_id,
                        author_id: row.user_id,
                    },
                };
                Self::send_internal(&tx, internal);
            }
            tracing::debug!(%topic, "feed forwarding finished");
        });
    }

    pub(super) fn handle_feed_opened(
        &mut self,
        session_token: u64,
        result: Result<SubscriptionHandle, SubscriptionError>,
    ) {
        match result {
            Ok(handle) => match self.session.as_mut() {
                Some(sess) if sess.token == session_token => sess.feeds.push(handle),
                _ => {
                    let transport = self.collaborators.transport.clone();
                    self.runtime.spawn(async move { transport.unsubscribe(handle).await });
                }
            },
            Err(e) => {
                if self.is_current_session(session_token) {
                    tracing::warn!(%e, "feed subscription failed");
                    self.toast("Live updates are unavailable.");
                }
            }
        }
    }

    pub(super) fn handle_inbox_message(
        &mut self,
        session_token: u64,
        group_id: &str,
        author_id: &str,
    ) {
        if !self.is_current_session(session_token) {
            return;
        }
        if self.session_user_id() == Some(author_id) || self.active_group_id() == Some(group_id) {
            return;
        }
        if self.unread.increment(group_id) {
            self.sync_groups();
            self.emit_state();
        }
    }
}

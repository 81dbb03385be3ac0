// In-process backend, media store and realtime transport.
//
// Used for local runs without a server and by the test suites. Every write is fanned out
// synchronously to matching subscribers, so per-topic order equals write order.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use flume::Sender;

use super::{
    ChatBackend, MediaStorage, MediaUpload, RealtimeEvent, RealtimeTransport, SubscriptionHandle,
    Topic,
};
use crate::error::BackendError;
use crate::state::{Group, MediaType, MessageRow, Profile};

const MEDIA_BASE_URL: &str = "memory://media";

#[derive(Debug, Default, Clone)]
struct Faults {
    fetch: bool,
    profiles: bool,
    persist: bool,
    upload: bool,
    subscribe: bool,
    return_rows: bool,
}

struct Subscriber {
    handle: SubscriptionHandle,
    sink: Sender<RealtimeEvent>,
}

#[derive(Default)]
struct HubState {
    groups: HashMap<String, Group>,
    // group_id -> member user ids
    members: HashMap<String, BTreeSet<String>>,
    profiles: HashMap<String, Profile>,
    messages: Vec<MessageRow>,
    blobs: HashMap<String, Vec<u8>>,
    subscribers: Vec<Subscriber>,
    next_id: u64,
    faults: Faults,
    profile_lookups: usize,
    persist_calls: usize,
}

impl HubState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn fan_out(&mut self, topic_matches: impl Fn(&Topic) -> bool, event: &RealtimeEvent) {
        self.subscribers.retain(|s| {
            if !topic_matches(&s.handle.topic) {
                return true;
            }
            // A dropped receiver means the subscriber is gone for good.
            s.sink.send(event.clone()).is_ok()
        });
    }

    fn insert_message(&mut self, mut row: MessageRow) -> MessageRow {
        let id = self.next_id();
        row.id = format!("msg-{id}");
        self.messages.push(row.clone());

        let members = self.members.get(&row.group_id).cloned().unwrap_or_default();
        let group_id = row.group_id.clone();
        self.fan_out(
            |topic| match topic {
                Topic::Group { group_id: g } => *g == group_id,
                Topic::Inbox { user_id } => members.contains(user_id),
                Topic::Memberships { .. } => false,
            },
            &RealtimeEvent::MessageInserted(row.clone()),
        );
        row
    }

    fn membership_changed(&mut self, user_id: &str, group_id: &str) {
        let event = RealtimeEvent::MembershipChanged {
            user_id: user_id.to_string(),
            group_id: group_id.to_string(),
        };
        self.fan_out(
            |topic| matches!(topic, Topic::Memberships { user_id: u } if u == user_id),
            &event,
        );
    }
}

#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubState>>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        let state = HubState {
            faults: Faults {
                return_rows: true,
                ..Faults::default()
            },
            ..HubState::default()
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    pub fn create_group(&self, id: &str, name: &str, description: Option<&str>) {
        let mut st = self.lock();
        st.groups.insert(
            id.to_string(),
            Group {
                id: id.to_string(),
                name: name.to_string(),
                description: description.map(ToString::to_string),
            },
        );
        st.members.entry(id.to_string()).or_default();
    }

    pub fn put_profile(&self, id: &str, username: &str, avatar_url: Option<&str>) {
        self.lock().profiles.insert(
            id.to_string(),
            Profile {
                id: id.to_string(),
                username: username.to_string(),
                avatar_url: avatar_url.map(ToString::to_string),
            },
        );
    }

    pub fn add_member(&self, group_id: &str, user_id: &str) {
        let mut st = self.lock();
        let inserted = st
            .members
            .entry(group_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        if inserted {
            st.membership_changed(user_id, group_id);
        }
    }

    pub fn remove_member(&self, group_id: &str, user_id: &str) {
        let mut st = self.lock();
        let removed = st
            .members
            .get_mut(group_id)
            .map(|m| m.remove(user_id))
            .unwrap_or(false);
        if removed {
            st.membership_changed(user_id, group_id);
        }
    }

    /// Writes a text message as `user_id`, as another client would.
    pub fn post_text(&self, group_id: &str, user_id: &str, content: &str) -> MessageRow {
        self.lock().insert_message(MessageRow {
            id: String::new(),
            group_id: group_id.to_string(),
            user_id: user_id.to_string(),
            content: Some(content.to_string()),
            media_url: None,
            media_type: None,
            created_at: Utc::now(),
        })
    }

    /// Delivers an event to every subscriber of `topic` without storing anything.
    /// Lets tests replay duplicates or inject rows for other groups.
    pub fn push_event(&self, topic: &Topic, event: RealtimeEvent) {
        self.lock().fan_out(|t| t == topic, &event);
    }

    pub fn messages_in(&self, group_id: &str) -> Vec<MessageRow> {
        self.lock()
            .messages
            .iter()
            .filter(|m| m.group_id == group_id)
            .cloned()
            .collect()
    }

    pub fn blob(&self, url: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(url).cloned()
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|s| s.handle.topic == *topic && !s.sink.is_disconnected())
            .count()
    }

    pub fn profile_lookups(&self) -> usize {
        self.lock().profile_lookups
    }

    pub fn persist_calls(&self) -> usize {
        self.lock().persist_calls
    }

    pub fn fail_fetches(&self, on: bool) {
        self.lock().faults.fetch = on;
    }

    pub fn fail_profiles(&self, on: bool) {
        self.lock().faults.profiles = on;
    }

    pub fn fail_persists(&self, on: bool) {
        self.lock().faults.persist = on;
    }

    pub fn fail_uploads(&self, on: bool) {
        self.lock().faults.upload = on;
    }

    pub fn fail_subscribes(&self, on: bool) {
        self.lock().faults.subscribe = on;
    }

    /// When off, persist calls return no row and the core relies on the realtime echo.
    pub fn return_rows(&self, on: bool) {
        self.lock().faults.return_rows = on;
    }

    fn persist(&self, row: MessageRow) -> Result<Option<MessageRow>, BackendError> {
        let mut st = self.lock();
        st.persist_calls += 1;
        if st.faults.persist {
            return Err(BackendError::Rejected {
                status: 500,
                message: "persist disabled".into(),
            });
        }
        let is_member = st
            .members
            .get(&row.group_id)
            .map(|m| m.contains(&row.user_id))
            .unwrap_or(false);
        if !is_member {
            return Err(BackendError::Rejected {
                status: 403,
                message: format!("{} is not a member of {}", row.user_id, row.group_id),
            });
        }
        let return_rows = st.faults.return_rows;
        let row = st.insert_message(row);
        Ok(return_rows.then_some(row))
    }
}

fn injected(what: &str) -> BackendError {
    BackendError::Transport(format!("{what} unavailable"))
}

#[async_trait]
impl ChatBackend for MemoryHub {
    async fn fetch_group_info(&self, group_id: &str) -> Result<Option<Group>, BackendError> {
        let st = self.lock();
        if st.faults.fetch {
            return Err(injected("group fetch"));
        }
        Ok(st.groups.get(group_id).cloned())
    }

    async fn fetch_messages(
        &self,
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRow>, BackendError> {
        let st = self.lock();
        if st.faults.fetch {
            return Err(injected("message fetch"));
        }
        let all: Vec<MessageRow> = st
            .messages
            .iter()
            .filter(|m| m.group_id == group_id)
            .cloned()
            .collect();
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn fetch_user_profiles(&self, ids: &[String]) -> Result<Vec<Profile>, BackendError> {
        let st = self.lock();
        if st.faults.profiles {
            return Err(injected("profile fetch"));
        }
        Ok(ids.iter().filter_map(|id| st.profiles.get(id).cloned()).collect())
    }

    async fn get_user_profile(&self, user_id: &str) -> Result<Profile, BackendError> {
        let mut st = self.lock();
        st.profile_lookups += 1;
        if st.faults.profiles {
            return Err(injected("profile fetch"));
        }
        st.profiles
            .get(user_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("profile {user_id}")))
    }

    async fn fetch_memberships(&self, user_id: &str) -> Result<Vec<Group>, BackendError> {
        let st = self.lock();
        if st.faults.fetch {
            return Err(injected("membership fetch"));
        }
        let mut groups: Vec<Group> = st
            .members
            .iter()
            .filter(|(_, users)| users.contains(user_id))
            .filter_map(|(gid, _)| st.groups.get(gid).cloned())
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn persist_text_message(
        &self,
        group_id: &str,
        user_id: &str,
        content: &str,
    ) -> Result<Option<MessageRow>, BackendError> {
        self.persist(MessageRow {
            id: String::new(),
            group_id: group_id.to_string(),
            user_id: user_id.to_string(),
            content: Some(content.to_string()),
            media_url: None,
            media_type: None,
            created_at: Utc::now(),
        })
    }

    async fn persist_media_message(
        &self,
        group_id: &str,
        user_id: &str,
        url: &str,
        media_type: MediaType,
    ) -> Result<Option<MessageRow>, BackendError> {
        self.persist(MessageRow {
            id: String::new(),
            group_id: group_id.to_string(),
            user_id: user_id.to_string(),
            content: Some(String::new()),
            media_url: Some(url.to_string()),
            media_type: Some(media_type),
            created_at: Utc::now(),
        })
    }
}

#[async_trait]
impl MediaStorage for MemoryHub {
    async fn upload_media(
        &self,
        upload: MediaUpload,
        owner_id: &str,
    ) -> Result<String, BackendError> {
        let mut st = self.lock();
        if st.faults.upload {
            return Err(BackendError::Rejected {
                status: 413,
                message: "upload disabled".into(),
            });
        }
        let id = st.next_id();
        let url = format!(
            "{MEDIA_BASE_URL}/{owner_id}/{id}.{}",
            upload.extension()
        );
        st.blobs.insert(url.clone(), upload.bytes);
        Ok(url)
    }
}

#[async_trait]
impl RealtimeTransport for MemoryHub {
    async fn subscribe(
        &self,
        topic: Topic,
        sink: Sender<RealtimeEvent>,
    ) -> Result<SubscriptionHandle, BackendError> {
        let mut st = self.lock();
        if st.faults.subscribe {
            return Err(injected("realtime"));
        }
        let handle = SubscriptionHandle {
            id: st.next_id(),
            topic,
        };
        st.subscribers.push(Subscriber {
            handle: handle.clone(),
            sink,
        });
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.lock().subscribers.retain(|s| s.handle.id != handle.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub_with_group() -> MemoryHub {
        let hub = MemoryHub::new();
        hub.create_group("g1", "general", None);
        hub.create_group("g2", "random", Some("off topic"));
        hub.add_member("g1", "alice");
        hub.add_member("g1", "bob");
        hub.add_member("g2", "bob");
        hub
    }

    #[tokio::test]
    async fn insert_fans_out_to_group_and_member_inboxes() {
        let hub = hub_with_group();
        let (tx_group, rx_group) = flume::unbounded();
        let (tx_inbox, rx_inbox) = flume::unbounded();
        let (tx_other, rx_other) = flume::unbounded();
        hub.subscribe(Topic::Group { group_id: "g1".into() }, tx_group)
            .await
            .expect("subscribe group");
        hub.subscribe(Topic::Inbox { user_id: "alice".into() }, tx_inbox)
            .await
            .expect("subscribe inbox");
        hub.subscribe(Topic::Group { group_id: "g2".into() }, tx_other)
            .await
            .expect("subscribe other");

        let row = hub.post_text("g1", "bob", "hey");

        assert_eq!(rx_group.try_recv(), Ok(RealtimeEvent::MessageInserted(row.clone())));
        assert_eq!(rx_inbox.try_recv(), Ok(RealtimeEvent::MessageInserted(row)));
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = hub_with_group();
        let (tx, rx) = flume::unbounded();
        let topic = Topic::Group { group_id: "g1".into() };
        let handle = hub.subscribe(topic.clone(), tx).await.expect("subscribe");
        assert_eq!(hub.subscriber_count(&topic), 1);

        hub.unsubscribe(handle).await;
        hub.post_text("g1", "bob", "after");

        assert_eq!(hub.subscriber_count(&topic), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn persist_rejects_non_members() {
        let hub = hub_with_group();
        let err = hub
            .persist_text_message("g2", "alice", "let me in")
            .await
            .expect_err("alice is not in g2");
        assert!(matches!(err, BackendError::Rejected { status: 403, .. }));
        assert!(hub.messages_in("g2").is_empty());
    }

    #[tokio::test]
    async fn fetch_messages_returns_latest_page_ascending() {
        let hub = hub_with_group();
        for i in 0..5 {
            hub.post_text("g1", "bob", &format!("m{i}"));
        }
        let page = hub.fetch_messages("g1", 2).await.expect("page");
        let contents: Vec<_> = page.iter().filter_map(|m| m.content.clone()).collect();
        assert_eq!(contents, vec!["m3".to_string(), "m4".to_string()]);
    }

    #[tokio::test]
    async fn membership_change_notifies_that_user_only() {
        let hub = hub_with_group();
        let (tx_bob, rx_bob) = flume::unbounded();
        let (tx_alice, rx_alice) = flume::unbounded();
        hub.subscribe(Topic::Memberships { user_id: "bob".into() }, tx_bob)
            .await
            .expect("subscribe bob");
        hub.subscribe(Topic::Memberships { user_id: "alice".into() }, tx_alice)
            .await
            .expect("subscribe alice");

        hub.remove_member("g2", "bob");

        assert_eq!(
            rx_bob.try_recv(),
            Ok(RealtimeEvent::MembershipChanged {
                user_id: "bob".into(),
                group_id: "g2".into(),
            })
        );
        assert!(rx_alice.try_recv().is_err());
        let groups = hub.fetch_memberships("bob").await.expect("memberships");
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, "g1");
    }

    #[tokio::test]
    async fn uploads_are_stored_under_owner() {
        let hub = hub_with_group();
        let url = hub
            .upload_media(
                MediaUpload {
                    bytes: vec![7, 7, 7],
                    media_type: MediaType::Gif,
                    mime_type: None,
                    filename: None,
                },
                "alice",
            )
            .await
            .expect("upload");
        assert!(url.starts_with("memory://media/alice/"), "got: {url}");
        assert!(url.ends_with(".gif"), "got: {url}");
        assert_eq!(hub.blob(&url), Some(vec![7, 7, 7]));
    }
}

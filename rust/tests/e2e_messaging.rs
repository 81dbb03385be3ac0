//! E2E messaging tests: two clients over one in-memory hub. Send, receive, dedup, unread,
//! media, rollback notification.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cognito_core::{
    AppReconciler, AppUpdate, AuthState, ChatApp, Collaborators, GroupLoadState, MediaType,
    MemoryHub, SendError, CONFIG_FILE_NAME,
};
use tempfile::{tempdir, TempDir};

fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("{what}: condition not met within {timeout:?}");
}

fn seeded_hub() -> MemoryHub {
    let hub = MemoryHub::new();
    hub.create_group("g1", "general", None);
    hub.create_group("g2", "random", None);
    hub.put_profile("alice", "Alice", None);
    hub.put_profile("bob", "Bob", None);
    for g in ["g1", "g2"] {
        hub.add_member(g, "alice");
        hub.add_member(g, "bob");
    }
    hub
}

struct Client {
    app: Arc<ChatApp>,
    _dir: TempDir,
}

fn client(hub: &MemoryHub, user_id: &str) -> Client {
    let dir = tempdir().unwrap();
    let app = ChatApp::new(
        dir.path().to_string_lossy().to_string(),
        Collaborators::in_memory(hub.clone()),
    );
    app.login(user_id);
    wait_until(&format!("{user_id} logged in"), Duration::from_secs(5), || {
        let s = app.state();
        matches!(s.auth, AuthState::LoggedIn { .. }) && s.groups.len() == 2
    });
    Client { app, _dir: dir }
}

fn open(app: &ChatApp, group_id: &str) {
    app.activate_group(Some(group_id.to_string()));
    wait_until(&format!("{group_id} live"), Duration::from_secs(5), || {
        app.state()
            .current_group
            .as_ref()
            .is_some_and(|g| g.group_id == group_id && g.load == GroupLoadState::Loaded && g.live)
    });
}

#[derive(Clone)]
struct Collector {
    updates: Arc<Mutex<Vec<AppUpdate>>>,
}

impl AppReconciler for Collector {
    fn reconcile(&self, update: AppUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

#[test]
fn alice_sends_bob_receives() {
    let hub = seeded_hub();
    let alice = client(&hub, "alice");
    let bob = client(&hub, "bob");
    open(&alice.app, "g1");
    open(&bob.app, "g1");

    alice.app.send_text("hi-from-alice");

    wait_until("alice message confirmed", Duration::from_secs(5), || {
        let msgs = alice.app.current_messages();
        msgs.len() == 1 && !msgs[0].is_pending() && !alice.app.is_sending()
    });
    wait_until("bob received", Duration::from_secs(5), || {
        bob.app.current_messages().len() == 1
    });

    let msg = &bob.app.current_messages()[0];
    assert_eq!(msg.content(), Some("hi-from-alice"));
    assert_eq!(msg.author_name, "Alice");
    assert_eq!(msg.id(), alice.app.current_messages()[0].id());

    // Neither side counts a message in the group it is looking at.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(bob.app.unread_count("g1"), 0);
    assert_eq!(alice.app.current_messages().len(), 1);
}

#[test]
fn unread_accumulates_until_group_is_opened() {
    let hub = seeded_hub();
    let alice = client(&hub, "alice");
    let bob = client(&hub, "bob");
    open(&alice.app, "g1");
    open(&bob.app, "g2");

    // One at a time: concurrent persists may land in either order.
    alice.app.send_text("one");
    wait_until("first persisted", Duration::from_secs(5), || hub.messages_in("g1").len() == 1);
    alice.app.send_text("two");
    wait_until("bob unread", Duration::from_secs(5), || {
        bob.app.unread_count("g1") == 2
    });
    assert_eq!(alice.app.unread_count("g1"), 0);

    open(&bob.app, "g1");
    assert_eq!(bob.app.unread_count("g1"), 0);
    let contents: Vec<String> = bob
        .app
        .current_messages()
        .iter()
        .filter_map(|m| m.content().map(ToString::to_string))
        .collect();
    assert_eq!(contents, vec!["one", "two"]);
}

#[test]
fn media_message_reaches_other_member() {
    let hub = seeded_hub();
    let alice = client(&hub, "alice");
    let bob = client(&hub, "bob");
    open(&alice.app, "g1");
    open(&bob.app, "g1");

    alice.app.send_media(vec![0xff, 0xd8, 0xff], "image");
    wait_until("bob got media", Duration::from_secs(5), || {
        bob.app.current_messages().len() == 1
    });
    let msg = &bob.app.current_messages()[0];
    assert_eq!(msg.media_type(), Some(MediaType::Image));
    let url = msg.media_url().unwrap().to_string();
    assert_eq!(hub.blob(&url), Some(vec![0xff, 0xd8, 0xff]));
    assert_eq!(msg.content(), None);

    wait_until("alice idle", Duration::from_secs(5), || !alice.app.is_sending());
    assert_eq!(alice.app.current_messages().len(), 1);
}

#[test]
fn listener_sees_rollback_notification() {
    let hub = seeded_hub();
    let alice = client(&hub, "alice");
    let updates = Arc::new(Mutex::new(Vec::<AppUpdate>::new()));
    alice.app.listen_for_updates(Box::new(Collector {
        updates: updates.clone(),
    }));
    open(&alice.app, "g1");
    hub.fail_persists(true);

    alice.app.send_text("will fail");
    wait_until("send failed", Duration::from_secs(5), || {
        updates
            .lock()
            .unwrap()
            .iter()
            .any(|u| matches!(u, AppUpdate::SendFailed { .. }))
    });
    wait_until("rolled back", Duration::from_secs(5), || {
        alice.app.current_messages().is_empty() && !alice.app.is_sending()
    });

    let updates = updates.lock().unwrap();
    let failed = updates
        .iter()
        .find_map(|u| match u {
            AppUpdate::SendFailed { temp_id, error, .. } => Some((temp_id.clone(), error.clone())),
            _ => None,
        })
        .unwrap();
    assert!(failed.0.unwrap().starts_with("temp-"));
    assert!(matches!(failed.1, SendError::Persist(_)));

    let revs: Vec<u64> = updates.iter().map(AppUpdate::rev).collect();
    assert!(revs.windows(2).all(|w| w[0] < w[1]), "revs must increase: {revs:?}");
}

#[test]
fn logout_stops_updates_for_that_client() {
    let hub = seeded_hub();
    let alice = client(&hub, "alice");
    let bob = client(&hub, "bob");
    open(&bob.app, "g2");

    bob.app.logout();
    wait_until("bob logged out", Duration::from_secs(5), || {
        bob.app.state().auth == AuthState::LoggedOut
    });
    open(&alice.app, "g1");
    alice.app.send_text("anyone?");
    wait_until("alice confirmed", Duration::from_secs(5), || !alice.app.is_sending());

    std::thread::sleep(Duration::from_millis(200));
    let s = bob.app.state();
    assert!(s.groups.is_empty());
    assert!(s.current_group.is_none());
    assert_eq!(bob.app.unread_count("g1"), 0);
}

#[test]
fn connect_without_backend_runs_offline() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join(CONFIG_FILE_NAME),
        serde_json::to_vec(&serde_json::json!({ "disable_network": true })).unwrap(),
    )
    .unwrap();

    let app = ChatApp::connect(dir.path().to_string_lossy().to_string()).unwrap();
    app.login("solo");
    wait_until("logged in", Duration::from_secs(5), || {
        matches!(app.state().auth, AuthState::LoggedIn { ref user_id } if user_id == "solo")
    });
    assert!(app.state().groups.is_empty());
}

#[test]
fn connect_rejects_bad_backend_url() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join(CONFIG_FILE_NAME),
        serde_json::to_vec(&serde_json::json!({ "backend_url": "not a url" })).unwrap(),
    )
    .unwrap();
    assert!(ChatApp::connect(dir.path().to_string_lossy().to_string()).is_err());
}

// Phoenix-channel realtime transport (postgres change feeds over a websocket).
//
// One socket per subscription keeps teardown trivial: unsubscribe leaves the channel and
// closes the socket, which drops the sink and ends the core's forwarding task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flume::{Receiver, Sender};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::{RealtimeEvent, RealtimeTransport, SubscriptionHandle, Topic};
use crate::error::BackendError;
use crate::state::MessageRow;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(8);
const JOIN_TIMEOUT: Duration = Duration::from_secs(8);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const JOIN_REF: &str = "1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

impl Frame {
    fn new(topic: &str, event: &str, payload: Value, reference: Option<String>) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference,
        }
    }

    fn encode(&self) -> String {
        // Serializing a struct of strings and a Value cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    fn decode(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// Channel name and postgres_changes filter for one topic.
#[derive(Debug, Clone, PartialEq)]
struct ChannelJoin {
    channel: String,
    changes: Value,
}

impl ChannelJoin {
    fn for_topic(topic: &Topic, global_inbox_fallback: bool) -> Self {
        match topic {
            Topic::Group { group_id } => Self {
                channel: format!("realtime:messages:{group_id}"),
                changes: json!([{
                    "event": "INSERT",
                    "schema": "public",
                    "table": "messages",
                    "filter": format!("group_id=eq.{group_id}"),
                }]),
            },
            Topic::Memberships { user_id } => Self {
                channel: format!("realtime:group_members:{user_id}"),
                changes: json!([{
                    "event": "*",
                    "schema": "public",
                    "table": "group_members",
                    "filter": format!("user_id=eq.{user_id}"),
                }]),
            },
            // Cluster-wide scan of every insert; the core filters by membership.
            Topic::Inbox { .. } if global_inbox_fallback => Self {
                channel: "realtime:messages".to_string(),
                changes: json!([{
                    "event": "INSERT",
                    "schema": "public",
                    "table": "messages",
                }]),
            },
            // Server-side per-user fan-out view fed by a trigger on `messages`.
            Topic::Inbox { user_id } => Self {
                channel: format!("realtime:inbox:{user_id}"),
                changes: json!([{
                    "event": "INSERT",
                    "schema": "public",
                    "table": "user_inbox",
                    "filter": format!("recipient_id=eq.{user_id}"),
                }]),
            },
        }
    }

    fn join_frame(&self, access_token: &str) -> Frame {
        Frame::new(
            &self.channel,
            "phx_join",
            json!({
                "config": { "postgres_changes": self.changes },
                "access_token": access_token,
            }),
            Some(JOIN_REF.to_string()),
        )
    }
}

/// `Ok(())` for an accepted join reply, the server's reason otherwise.
fn join_reply(frame: &Frame) -> Option<Result<(), String>> {
    if frame.event != "phx_reply" || frame.reference.as_deref() != Some(JOIN_REF) {
        return None;
    }
    let status = frame.payload.get("status").and_then(Value::as_str);
    if status == Some("ok") {
        return Some(Ok(()));
    }
    let reason = frame
        .payload
        .get("response")
        .map(Value::to_string)
        .unwrap_or_else(|| format!("status {}", status.unwrap_or("missing")));
    Some(Err(reason))
}

/// Maps a postgres_changes frame to a core event.
fn decode_change(frame: &Frame) -> Option<RealtimeEvent> {
    if frame.event != "postgres_changes" {
        return None;
    }
    let data = frame.payload.get("data")?;
    let change = data.get("type").and_then(Value::as_str)?;
    let table = data.get("table").and_then(Value::as_str)?;
    match table {
        "messages" | "user_inbox" if change == "INSERT" => {
            let record = data.get("record")?.clone();
            match serde_json::from_value::<MessageRow>(record) {
                Ok(row) => Some(RealtimeEvent::MessageInserted(row)),
                Err(e) => {
                    tracing::warn!(%e, table, "realtime: undecodable message record");
                    None
                }
            }
        }
        "group_members" => {
            // Deletes only carry the old record.
            let record = data
                .get("record")
                .filter(|r| r.get("user_id").is_some())
                .or_else(|| data.get("old_record"))?;
            let user_id = record.get("user_id").and_then(Value::as_str)?;
            let group_id = record.get("group_id").and_then(Value::as_str)?;
            Some(RealtimeEvent::MembershipChanged {
                user_id: user_id.to_string(),
                group_id: group_id.to_string(),
            })
        }
        _ => None,
    }
}

/// `https://x.supabase.co` -> `wss://x.supabase.co/realtime/v1/websocket`.
pub(super) fn default_realtime_url(backend_url: &str) -> anyhow::Result<String> {
    let mut url = Url::parse(backend_url.trim())?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => anyhow::bail!("unsupported backend url scheme: {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("cannot rewrite url scheme"))?;
    let path = format!("{}/realtime/v1/websocket", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url.to_string())
}

pub struct WsTransport {
    url: Url,
    api_key: String,
    // User JWT; row-level security filters the change feed by it.
    access_token: Option<String>,
    global_inbox_fallback: bool,
    next_id: AtomicU64,
    // handle id -> stop signal for the channel task
    live: Arc<Mutex<HashMap<u64, Sender<()>>>>,
}

impl WsTransport {
    pub fn new(realtime_url: &str, api_key: String) -> anyhow::Result<Self> {
        let mut url = Url::parse(realtime_url.trim())?;
        if !matches!(url.scheme(), "ws" | "wss") {
            anyhow::bail!("realtime url must be ws:// or wss://, got {realtime_url}");
        }
        url.query_pairs_mut()
            .append_pair("apikey", &api_key)
            .append_pair("vsn", "1.0.0");
        Ok(Self {
            url,
            api_key,
            access_token: None,
            global_inbox_fallback: false,
            next_id: AtomicU64::new(1),
            live: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn with_access_token(mut self, access_token: Option<String>) -> Self {
        self.access_token = access_token.filter(|t| !t.trim().is_empty());
        self
    }

    /// Token sent with `phx_join`: the user's access token, else the api key.
    fn join_token(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.api_key)
    }

    pub fn with_global_inbox_fallback(mut self, on: bool) -> Self {
        self.global_inbox_fallback = on;
        self
    }

    fn live_channels(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Sender<()>>> {
        match self.live.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn await_join(ws: &mut WsStream) -> Result<(), BackendError> {
    let wait = async {
        while let Some(msg) = ws.next().await {
            let msg = msg.map_err(|e| BackendError::Transport(e.to_string()))?;
            let Ok(text) = msg.to_text() else {
                continue;
            };
            let Some(frame) = Frame::decode(text) else {
                continue;
            };
            match join_reply(&frame) {
                Some(Ok(())) => return Ok(()),
                Some(Err(reason)) => {
                    return Err(BackendError::Rejected {
                        status: 0,
                        message: reason,
                    })
                }
                None => continue,
            }
        }
        Err(BackendError::Transport(
            "socket closed before join reply".into(),
        ))
    };
    tokio::time::timeout(JOIN_TIMEOUT, wait)
        .await
        .map_err(|_| BackendError::Timeout)?
}

async fn run_channel(
    mut ws: WsStream,
    channel: String,
    sink: Sender<RealtimeEvent>,
    stop: Receiver<()>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut seq: u64 = 1;
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                seq += 1;
                let frame = Frame::new("phoenix", "heartbeat", json!({}), Some(seq.to_string()));
                if let Err(e) = ws.send(Message::text(frame.encode())).await {
                    tracing::warn!(%e, %channel, "realtime: heartbeat failed");
                    break;
                }
            }
            _ = stop.recv_async() => {
                seq += 1;
                let leave = Frame::new(&channel, "phx_leave", json!({}), Some(seq.to_string()));
                let _ = ws.send(Message::text(leave.encode())).await;
                let _ = ws.close(None).await;
                break;
            }
            incoming = ws.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        tracing::warn!(%e, %channel, "realtime: socket error");
                        break;
                    }
                    None => break,
                };
                if msg.is_close() {
                    break;
                }
                let Ok(text) = msg.to_text() else {
                    continue;
                };
                let Some(frame) = Frame::decode(text) else {
                    continue;
                };
                if frame.event == "phx_error" || frame.event == "phx_close" {
                    tracing::warn!(%channel, event = %frame.event, "realtime: channel closed by server");
                    break;
                }
                if let Some(event) = decode_change(&frame) {
                    if sink.send(event).is_err() {
                        break;
                    }
                }
            }
        }
    }
    tracing::info!(%channel, "realtime: channel finished");
}

#[async_trait]
impl RealtimeTransport for WsTransport {
    async fn subscribe(
        &self,
        topic: Topic,
        sink: Sender<RealtimeEvent>,
    ) -> Result<SubscriptionHandle, BackendError> {
        let join = ChannelJoin::for_topic(&topic, self.global_inbox_fallback);

        let (mut ws, _) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| BackendError::Timeout)?
        .map_err(|e| BackendError::Transport(e.to_string()))?;

        ws.send(Message::text(join.join_frame(self.join_token()).encode()))
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        await_join(&mut ws).await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (stop_tx, stop_rx) = flume::bounded(1);
        self.live_channels().insert(id, stop_tx);

        tracing::info!(%topic, channel = %join.channel, "realtime: joined");
        let live = self.live.clone();
        tokio::spawn(async move {
            run_channel(ws, join.channel, sink, stop_rx).await;
            if let Ok(mut g) = live.lock() {
                g.remove(&id);
            }
        });

        Ok(SubscriptionHandle { id, topic })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let stop = self.live_channels().remove(&handle.id);
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_join_filters_by_group_id() {
        let join = ChannelJoin::for_topic(
            &Topic::Group {
                group_id: "g1".into(),
            },
            false,
        );
        assert_eq!(join.channel, "realtime:messages:g1");
        let frame = join.join_frame("anon");
        assert_eq!(frame.event, "phx_join");
        assert_eq!(frame.reference.as_deref(), Some(JOIN_REF));
        assert_eq!(
            frame.payload["config"]["postgres_changes"][0]["filter"],
            "group_id=eq.g1"
        );
    }

    #[test]
    fn inbox_uses_fan_out_view_unless_fallback() {
        let topic = Topic::Inbox {
            user_id: "u1".into(),
        };
        let fan_out = ChannelJoin::for_topic(&topic, false);
        assert_eq!(fan_out.changes[0]["table"], "user_inbox");
        assert_eq!(fan_out.changes[0]["filter"], "recipient_id=eq.u1");

        let global = ChannelJoin::for_topic(&topic, true);
        assert_eq!(global.changes[0]["table"], "messages");
        assert!(global.changes[0].get("filter").is_none());
    }

    #[test]
    fn insert_change_decodes_to_message_row() {
        let text = json!({
            "topic": "realtime:messages:g1",
            "event": "postgres_changes",
            "payload": { "data": {
                "type": "INSERT",
                "table": "messages",
                "record": {
                    "id": "m1",
                    "group_id": "g1",
                    "user_id": "u2",
                    "content": "hello",
                    "media_url": null,
                    "media_type": null,
                    "created_at": "2024-05-01T10:00:00Z"
                }
            }},
            "ref": null
        })
        .to_string();
        let frame = Frame::decode(&text).expect("frame");
        match decode_change(&frame) {
            Some(RealtimeEvent::MessageInserted(row)) => {
                assert_eq!(row.id, "m1");
                assert_eq!(row.group_id, "g1");
                assert_eq!(row.content.as_deref(), Some("hello"));
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn message_updates_are_ignored() {
        let frame = Frame::new(
            "realtime:messages:g1",
            "postgres_changes",
            json!({ "data": { "type": "UPDATE", "table": "messages", "record": {} } }),
            None,
        );
        assert_eq!(decode_change(&frame), None);
    }

    #[test]
    fn membership_delete_reads_old_record() {
        let frame = Frame::new(
            "realtime:group_members:u1",
            "postgres_changes",
            json!({ "data": {
                "type": "DELETE",
                "table": "group_members",
                "record": {},
                "old_record": { "user_id": "u1", "group_id": "g7" }
            }}),
            None,
        );
        assert_eq!(
            decode_change(&frame),
            Some(RealtimeEvent::MembershipChanged {
                user_id: "u1".into(),
                group_id: "g7".into(),
            })
        );
    }

    #[test]
    fn join_reply_reports_rejection_reason() {
        let ok = Frame::new(
            "realtime:messages:g1",
            "phx_reply",
            json!({"status": "ok", "response": {}}),
            Some(JOIN_REF.into()),
        );
        assert_eq!(join_reply(&ok), Some(Ok(())));

        let denied = Frame::new(
            "realtime:messages:g1",
            "phx_reply",
            json!({"status": "error", "response": {"reason": "unauthorized"}}),
            Some(JOIN_REF.into()),
        );
        match join_reply(&denied) {
            Some(Err(reason)) => assert!(reason.contains("unauthorized"), "got: {reason}"),
            other => panic!("expected rejection, got {other:?}"),
        }

        let heartbeat_reply = Frame::new("phoenix", "phx_reply", json!({"status": "ok"}), Some("2".into()));
        assert_eq!(join_reply(&heartbeat_reply), None);
    }

    #[test]
    fn realtime_url_is_derived_from_backend_url() {
        assert_eq!(
            default_realtime_url("https://abc.example.co").expect("url"),
            "wss://abc.example.co/realtime/v1/websocket"
        );
        assert_eq!(
            default_realtime_url("http://localhost:54321/").expect("url"),
            "ws://localhost:54321/realtime/v1/websocket"
        );
        assert!(default_realtime_url("ftp://nope").is_err());
    }

    #[test]
    fn join_uses_user_access_token_when_configured() {
        let url = "wss://abc.example.co/realtime/v1/websocket";
        let anon = WsTransport::new(url, "anon".into()).expect("transport");
        assert_eq!(anon.join_token(), "anon");

        let blank = WsTransport::new(url, "anon".into())
            .expect("transport")
            .with_access_token(Some("  ".into()));
        assert_eq!(blank.join_token(), "anon");

        let user = WsTransport::new(url, "anon".into())
            .expect("transport")
            .with_access_token(Some("user-jwt".into()));
        assert_eq!(user.join_token(), "user-jwt");
        let join = ChannelJoin::for_topic(
            &Topic::Inbox {
                user_id: "u1".into(),
            },
            false,
        );
        let frame = join.join_frame(user.join_token());
        assert_eq!(frame.payload["access_token"], "user-jwt");
        // The socket itself still authenticates with the project key.
        assert!(user.url.as_str().contains("apikey=anon"));
    }

    #[test]
    fn transport_adds_api_key_and_protocol_version() {
        let t = WsTransport::new("wss://abc.example.co/realtime/v1/websocket", "anon".into())
            .expect("transport");
        assert_eq!(
            t.url.as_str(),
            "wss://abc.example.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
        assert!(WsTransport::new("https://abc.example.co", "anon".into()).is_err());
    }
}

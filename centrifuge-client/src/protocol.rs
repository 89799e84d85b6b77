//! Centrifuge wire protocol types, constants, and the JSON codec.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

/// Error codes carried in server replies.
pub mod error_code {
    pub const INTERNAL: u32 = 100;
    pub const UNAUTHORIZED: u32 = 101;
    pub const UNKNOWN_CHANNEL: u32 = 102;
    pub const PERMISSION_DENIED: u32 = 103;
    pub const METHOD_NOT_FOUND: u32 = 104;
    pub const ALREADY_SUBSCRIBED: u32 = 105;
    pub const LIMIT_EXCEEDED: u32 = 106;
    pub const BAD_REQUEST: u32 = 107;
    pub const NOT_AVAILABLE: u32 = 108;
    pub const TOKEN_EXPIRED: u32 = 109;
}

/// Disconnect codes produced by the client itself.
pub mod disconnect_code {
    /// `disconnect()` was called, or the pause layer synthesized an event.
    pub const CLEAN: u32 = 0;
    pub const CONNECTION_CLOSED: u32 = 4;
    pub const CONNECT_ERROR: u32 = 6;
    pub const REFRESH_ERROR: u32 = 7;
    pub const NO_PING: u32 = 11;
    pub const BAD_PROTOCOL: u32 = 12;
    pub const UNSUBSCRIBE_ERROR: u32 = 13;
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

// ---------------------------------------------------------------------------
// Commands (client → server)
// ---------------------------------------------------------------------------

/// One outgoing frame. A command with no request is the pong reply to a
/// server ping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub id: u32,
    #[serde(flatten)]
    pub request: Option<Request>,
}

impl Command {
    pub fn new(id: u32, request: Request) -> Self {
        Self {
            id,
            request: Some(request),
        }
    }

    pub fn pong() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    Connect(ConnectRequest),
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    Publish(PublishRequest),
    Presence(PresenceRequest),
    PresenceStats(PresenceStatsRequest),
    History(HistoryRequest),
    Rpc(RpcRequest),
    Send(SendRequest),
    Refresh(RefreshRequest),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Recovery descriptors for server-side subscriptions, keyed by channel.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub subs: HashMap<String, SubscribeRequest>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(skip_serializing_if = "is_false")]
    pub recover: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub epoch: String,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub offset: u64,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnsubscribeRequest {
    pub channel: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishRequest {
    pub channel: String,
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceRequest {
    pub channel: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceStatsRequest {
    pub channel: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryRequest {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<StreamPosition>,
    #[serde(skip_serializing_if = "is_false")]
    pub reverse: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcRequest {
    pub method: String,
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendRequest {
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshRequest {
    pub token: String,
}

/// Position in a channel stream, used for recovery and history paging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamPosition {
    pub offset: u64,
    pub epoch: String,
}

// ---------------------------------------------------------------------------
// Replies and pushes (server → client)
// ---------------------------------------------------------------------------

/// One decoded incoming unit: a reply when `id > 0`, otherwise a push, or a
/// server ping when empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reply {
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push: Option<Push>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect: Option<ConnectResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<SubscribeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsubscribe: Option<UnsubscribeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_stats: Option<PresenceStatsResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc: Option<RpcResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh: Option<RefreshResult>,
}

impl Reply {
    /// Split off a server-side error, if the reply carries one.
    pub fn into_result(mut self) -> Result<Self, Error> {
        match self.error.take() {
            Some(e) => Err(Error::Reply {
                code: e.code,
                message: e.message,
            }),
            None => Ok(self),
        }
    }

    pub fn is_ping(&self) -> bool {
        self.id == 0 && self.push.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorInfo {
    pub code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "is_false")]
    pub temporary: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectResult {
    pub client: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "is_false")]
    pub expires: bool,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub ttl: u32,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub subs: HashMap<String, SubscribeResult>,
    /// Server ping interval in seconds; zero disables ping monitoring.
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub ping: u32,
    #[serde(skip_serializing_if = "is_false")]
    pub pong: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeResult {
    #[serde(skip_serializing_if = "is_false")]
    pub expires: bool,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub ttl: u32,
    #[serde(skip_serializing_if = "is_false")]
    pub recoverable: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub epoch: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub publications: Vec<Publication>,
    #[serde(skip_serializing_if = "is_false")]
    pub recovered: bool,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub offset: u64,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnsubscribeResult {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishResult {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceResult {
    pub presence: HashMap<String, ClientInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceStatsResult {
    pub num_clients: u32,
    pub num_users: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryResult {
    pub publications: Vec<Publication>,
    pub epoch: String,
    pub offset: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcResult {
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshResult {
    pub client: String,
    pub version: String,
    pub expires: bool,
    pub ttl: u32,
}

/// A message published into a channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Publication {
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub offset: u64,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<ClientInfo>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

/// Identity of a connected client, as reported in presence, join and leave.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientInfo {
    pub user: String,
    pub client: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conn_info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chan_info: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Push {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(rename = "pub", skip_serializing_if = "Option::is_none")]
    pub publication: Option<Publication>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join: Option<Join>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leave: Option<Leave>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsubscribe: Option<Unsubscribe>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<ServerSubscribe>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<PushMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnect: Option<DisconnectPush>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Join {
    pub info: ClientInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Leave {
    pub info: ClientInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Unsubscribe {
    pub code: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSubscribe {
    pub recoverable: bool,
    pub epoch: String,
    pub offset: u64,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushMessage {
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisconnectPush {
    pub code: u32,
    pub reason: String,
}

/// A push resolved to exactly one kind.
#[derive(Debug, Clone, PartialEq)]
pub enum PushKind {
    Publication(Publication),
    Join(ClientInfo),
    Leave(ClientInfo),
    Unsubscribe(Unsubscribe),
    Subscribe(ServerSubscribe),
    Message(Value),
    Disconnect(DisconnectPush),
    Unknown,
}

impl Push {
    /// Resolve the push into its channel and kind. When a malformed push
    /// carries several bodies, the first in declaration order wins.
    pub fn into_kind(self) -> (String, PushKind) {
        let kind = if let Some(p) = self.publication {
            PushKind::Publication(p)
        } else if let Some(j) = self.join {
            PushKind::Join(j.info)
        } else if let Some(l) = self.leave {
            PushKind::Leave(l.info)
        } else if let Some(u) = self.unsubscribe {
            PushKind::Unsubscribe(u)
        } else if let Some(s) = self.subscribe {
            PushKind::Subscribe(s)
        } else if let Some(m) = self.message {
            PushKind::Message(m.data)
        } else if let Some(d) = self.disconnect {
            PushKind::Disconnect(d)
        } else {
            PushKind::Unknown
        };
        (self.channel, kind)
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Serializer for command batches and reply streams.
pub trait Codec: Send + 'static {
    fn encode(&self, commands: &[Command]) -> Result<Vec<u8>, Error>;
    fn decode(&self, data: &[u8]) -> Result<Vec<Reply>, Error>;
}

/// Newline-delimited JSON, the Centrifuge JSON protocol framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, commands: &[Command]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        for (i, command) in commands.iter().enumerate() {
            if i > 0 {
                out.push(b'\n');
            }
            serde_json::to_writer(&mut out, command).map_err(Error::Encode)?;
        }
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<Reply>, Error> {
        data.split(|b| *b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .map(|line| serde_json::from_slice(line).map_err(Error::Decode))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_connect_command() {
        let cmd = Command::new(
            1,
            Request::Connect(ConnectRequest {
                token: "tok".into(),
                name: "rust".into(),
                ..Default::default()
            }),
        );
        let bytes = JsonCodec.encode(&[cmd]).unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": 1, "connect": {"token": "tok", "name": "rust"}})
        );
    }

    #[test]
    fn encode_batch_is_newline_delimited() {
        let cmds = [
            Command::new(
                1,
                Request::Presence(PresenceRequest {
                    channel: "a".into(),
                }),
            ),
            Command::new(
                2,
                Request::PresenceStats(PresenceStatsRequest {
                    channel: "b".into(),
                }),
            ),
        ];
        let bytes = JsonCodec.encode(&cmds).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""presence":{"channel":"a"}"#));
        assert!(lines[1].contains(r#""presence_stats":{"channel":"b"}"#));
    }

    #[test]
    fn pong_encodes_as_empty_object() {
        let bytes = JsonCodec.encode(&[Command::pong()]).unwrap();
        assert_eq!(bytes, b"{}");
    }

    #[test]
    fn subscribe_recovery_fields_skipped_when_unset() {
        let cmd = Command::new(
            3,
            Request::Subscribe(SubscribeRequest {
                channel: "index".into(),
                ..Default::default()
            }),
        );
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": 3, "subscribe": {"channel": "index"}})
        );
    }

    #[test]
    fn decode_reply_with_error() {
        let data = br#"{"id":5,"error":{"code":109,"message":"token expired"}}"#;
        let replies = JsonCodec.decode(data).unwrap();
        assert_eq!(replies.len(), 1);
        let err = replies[0].clone().into_result().unwrap_err();
        match err {
            Error::Reply { code, message } => {
                assert_eq!(code, error_code::TOKEN_EXPIRED);
                assert_eq!(message, "token expired");
            }
            other => panic!("expected Reply error, got {other:?}"),
        }
    }

    #[test]
    fn decode_mixed_batch() {
        let data = concat!(
            r#"{"id":1,"connect":{"client":"c1","ping":25,"pong":true}}"#,
            "\n",
            r#"{"push":{"channel":"news","pub":{"offset":5,"data":{"x":1}}}}"#,
            "\n",
            "{}\n"
        );
        let replies = JsonCodec.decode(data.as_bytes()).unwrap();
        assert_eq!(replies.len(), 3);

        let connect = replies[0].connect.as_ref().unwrap();
        assert_eq!(connect.client, "c1");
        assert_eq!(connect.ping, 25);
        assert!(connect.pong);

        let (channel, kind) = replies[1].push.clone().unwrap().into_kind();
        assert_eq!(channel, "news");
        match kind {
            PushKind::Publication(p) => {
                assert_eq!(p.offset, 5);
                assert_eq!(p.data, serde_json::json!({"x": 1}));
            }
            other => panic!("expected publication, got {other:?}"),
        }

        assert!(replies[2].is_ping());
    }

    #[test]
    fn decode_malformed_fails() {
        assert!(matches!(
            JsonCodec.decode(b"{not json"),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn push_kinds() {
        let join: Push = serde_json::from_value(serde_json::json!({
            "channel": "chat",
            "join": {"info": {"user": "u1", "client": "c1"}}
        }))
        .unwrap();
        let (_, kind) = join.into_kind();
        assert!(matches!(kind, PushKind::Join(ref info) if info.user == "u1"));

        let unsub: Push = serde_json::from_value(serde_json::json!({
            "channel": "chat",
            "unsubscribe": {"code": 2000, "reason": "server unsubscribe"}
        }))
        .unwrap();
        let (_, kind) = unsub.into_kind();
        assert!(matches!(kind, PushKind::Unsubscribe(ref u) if u.code == 2000));

        let (_, kind) = Push::default().into_kind();
        assert_eq!(kind, PushKind::Unknown);
    }
}

//! Wire message model for the wavelink protocol.
//!
//! Messages travel as flat JSON records and are discriminated by which
//! fields are present, not by a shared type tag. Decoding happens in a
//! single step: the raw record is read into an all-optional shape and then
//! classified into one of the closed sum types below, so routing code never
//! has to sniff fields itself.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Identifier for one outstanding request or one subscription, unique for
/// the lifetime of a connection. Callers may supply either form; ids the
/// transport assigns itself are numeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Num(u64),
    Str(String),
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Id::Num(value)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Id::Str(value.to_string())
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Id::Str(value)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Num(n) => write!(f, "{n}"),
            Id::Str(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Query,
    Mutation,
}

/// Terminal outcome of a procedure call, tagged on the wire as
/// `{"kind":"data","value":...}` or `{"kind":"error","error":...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CallResult {
    Data { value: Value },
    Error { error: Value },
}

/// One sequenced subscription update. `server_seq` is strictly increasing
/// per topic; `prev_server_seq`, when present, names the sequence this delta
/// logically follows so a consumer can detect a missing predecessor even if
/// delivery order was violated.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionData {
    pub id: Id,
    pub data: Value,
    pub server_seq: u64,
    pub prev_server_seq: Option<u64>,
}

/// Messages a client sends to its peer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Call {
        kind: CallKind,
        id: Id,
        path: String,
        input: Option<Value>,
    },
    Subscribe {
        id: Id,
        path: String,
        input: Option<Value>,
    },
    Unsubscribe {
        id: Id,
    },
    RequestMissing {
        id: Id,
        from_seq: u64,
        to_seq: u64,
    },
}

impl ClientMessage {
    pub fn id(&self) -> &Id {
        match self {
            ClientMessage::Call { id, .. }
            | ClientMessage::Subscribe { id, .. }
            | ClientMessage::Unsubscribe { id }
            | ClientMessage::RequestMissing { id, .. } => id,
        }
    }
}

/// Messages a server pushes back.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Result {
        id: Id,
        result: CallResult,
    },
    Data(SubscriptionData),
    Error {
        id: Id,
        error: Value,
    },
    End {
        id: Id,
    },
    Ack {
        id: Id,
        client_seq: u64,
        server_seq: u64,
    },
}

impl ServerMessage {
    pub fn id(&self) -> &Id {
        match self {
            ServerMessage::Result { id, .. }
            | ServerMessage::Error { id, .. }
            | ServerMessage::End { id }
            | ServerMessage::Ack { id, .. } => id,
            ServerMessage::Data(data) => &data.id,
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message shape matches no known message type")]
    UnknownShape,
    #[error("{0} message is missing an id")]
    MissingId(&'static str),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawClientMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<CallKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Id>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    from_seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    to_seq: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawServerMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Id>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<CallResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev_server_seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_seq: Option<u64>,
}

impl RawClientMessage {
    fn classify(self) -> Result<ClientMessage, WireError> {
        let RawClientMessage {
            kind,
            id,
            path,
            input,
            from_seq,
            to_seq,
        } = self;

        if let (Some(from_seq), Some(to_seq)) = (from_seq, to_seq) {
            let id = id.ok_or(WireError::MissingId("requestMissing"))?;
            return Ok(ClientMessage::RequestMissing {
                id,
                from_seq,
                to_seq,
            });
        }
        if let Some(path) = path {
            return match kind {
                Some(kind) => Ok(ClientMessage::Call {
                    kind,
                    id: id.ok_or(WireError::MissingId("call"))?,
                    path,
                    input,
                }),
                None => Ok(ClientMessage::Subscribe {
                    id: id.ok_or(WireError::MissingId("subscribe"))?,
                    path,
                    input,
                }),
            };
        }
        if let Some(id) = id {
            return Ok(ClientMessage::Unsubscribe { id });
        }
        Err(WireError::UnknownShape)
    }
}

impl RawServerMessage {
    fn classify(self) -> Result<ServerMessage, WireError> {
        let RawServerMessage {
            id,
            result,
            data,
            server_seq,
            prev_server_seq,
            error,
            end,
            client_seq,
        } = self;

        if let Some(result) = result {
            let id = id.ok_or(WireError::MissingId("result"))?;
            return Ok(ServerMessage::Result { id, result });
        }
        if let Some(client_seq) = client_seq {
            let id = id.ok_or(WireError::MissingId("ack"))?;
            return Ok(ServerMessage::Ack {
                id,
                client_seq,
                server_seq: server_seq.ok_or(WireError::UnknownShape)?,
            });
        }
        if let Some(error) = error {
            let id = id.ok_or(WireError::MissingId("error"))?;
            return Ok(ServerMessage::Error { id, error });
        }
        if let Some(server_seq) = server_seq {
            let id = id.ok_or(WireError::MissingId("data"))?;
            // `data: null` is a legal update payload; absence and null are
            // indistinguishable once the record is parsed.
            return Ok(ServerMessage::Data(SubscriptionData {
                id,
                data: data.unwrap_or(Value::Null),
                server_seq,
                prev_server_seq,
            }));
        }
        if end == Some(true) {
            let id = id.ok_or(WireError::MissingId("end"))?;
            return Ok(ServerMessage::End { id });
        }
        Err(WireError::UnknownShape)
    }
}

impl From<&ClientMessage> for RawClientMessage {
    fn from(message: &ClientMessage) -> Self {
        match message {
            ClientMessage::Call {
                kind,
                id,
                path,
                input,
            } => RawClientMessage {
                kind: Some(*kind),
                id: Some(id.clone()),
                path: Some(path.clone()),
                input: input.clone(),
                ..Default::default()
            },
            ClientMessage::Subscribe { id, path, input } => RawClientMessage {
                id: Some(id.clone()),
                path: Some(path.clone()),
                input: input.clone(),
                ..Default::default()
            },
            ClientMessage::Unsubscribe { id } => RawClientMessage {
                id: Some(id.clone()),
                ..Default::default()
            },
            ClientMessage::RequestMissing {
                id,
                from_seq,
                to_seq,
            } => RawClientMessage {
                id: Some(id.clone()),
                from_seq: Some(*from_seq),
                to_seq: Some(*to_seq),
                ..Default::default()
            },
        }
    }
}

impl From<&ServerMessage> for RawServerMessage {
    fn from(message: &ServerMessage) -> Self {
        match message {
            ServerMessage::Result { id, result } => RawServerMessage {
                id: Some(id.clone()),
                result: Some(result.clone()),
                ..Default::default()
            },
            ServerMessage::Data(data) => RawServerMessage {
                id: Some(data.id.clone()),
                data: Some(data.data.clone()),
                server_seq: Some(data.server_seq),
                prev_server_seq: data.prev_server_seq,
                ..Default::default()
            },
            ServerMessage::Error { id, error } => RawServerMessage {
                id: Some(id.clone()),
                error: Some(error.clone()),
                ..Default::default()
            },
            ServerMessage::End { id } => RawServerMessage {
                id: Some(id.clone()),
                end: Some(true),
                ..Default::default()
            },
            ServerMessage::Ack {
                id,
                client_seq,
                server_seq,
            } => RawServerMessage {
                id: Some(id.clone()),
                client_seq: Some(*client_seq),
                server_seq: Some(*server_seq),
                ..Default::default()
            },
        }
    }
}

pub fn encode_client_message(message: &ClientMessage) -> Result<String, WireError> {
    serde_json::to_string(&RawClientMessage::from(message)).map_err(WireError::from)
}

pub fn decode_client_message(text: &str) -> Result<ClientMessage, WireError> {
    serde_json::from_str::<RawClientMessage>(text)?.classify()
}

pub fn encode_server_message(message: &ServerMessage) -> Result<String, WireError> {
    serde_json::to_string(&RawServerMessage::from(message)).map_err(WireError::from)
}

pub fn decode_server_message(text: &str) -> Result<ServerMessage, WireError> {
    serde_json::from_str::<RawServerMessage>(text)?.classify()
}

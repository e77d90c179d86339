//! Server-side dispatch: routes decoded client messages to application
//! handlers and manages subscription lifecycles.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};
use wavelink_proto::{CallKind, CallResult, ClientMessage, Id, ServerMessage, SubscriptionData};

use crate::history::UpdateHistory;
use crate::registry::{Cleanup, SubscriptionRegistry};
use crate::transport::TransportError;

/// Application-side handler seam. One implementation per service; the
/// endpoint owns the routing, the router owns the semantics.
#[async_trait]
pub trait Router: Send + Sync {
    /// Resolves a procedure call. `Err` carries the error payload exactly as
    /// it should reach the caller.
    async fn handle_call(
        &self,
        kind: CallKind,
        path: &str,
        input: Option<Value>,
    ) -> Result<Value, Value>;

    /// Starts a subscription, publishing through `publisher` for as long as
    /// it lives. Returns the teardown action, or the error payload when the
    /// subscription cannot start.
    async fn handle_subscribe(
        &self,
        path: &str,
        input: Option<Value>,
        publisher: Publisher,
    ) -> Result<Cleanup, Value>;
}

/// Server half of a carrier: how encoded server messages reach this
/// connection's peer.
pub trait ServerWire: Send + Sync {
    fn send(&self, message: &ServerMessage) -> Result<(), TransportError>;
}

/// Publishing handle for one subscription. Records every update in the
/// replay log before pushing it, so a later gap-fill can re-deliver it.
#[derive(Clone)]
pub struct Publisher {
    id: Id,
    topic: String,
    wire: Arc<dyn ServerWire>,
    history: Arc<UpdateHistory>,
}

impl Publisher {
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Pushes one sequenced update. `prev_server_seq` names the predecessor
    /// the consumer should already hold; `None` opts the update out of gap
    /// detection.
    pub fn publish(
        &self,
        data: Value,
        server_seq: u64,
        prev_server_seq: Option<u64>,
    ) -> Result<(), TransportError> {
        let message = SubscriptionData {
            id: self.id.clone(),
            data,
            server_seq,
            prev_server_seq,
        };
        self.history.record(&self.topic, &message);
        self.wire.send(&ServerMessage::Data(message))
    }

    /// Terminal error: the consumer's stream yields the payload and completes.
    pub fn error(&self, error: Value) -> Result<(), TransportError> {
        self.wire.send(&ServerMessage::Error {
            id: self.id.clone(),
            error,
        })
    }

    /// Graceful completion.
    pub fn end(&self) -> Result<(), TransportError> {
        self.wire.send(&ServerMessage::End {
            id: self.id.clone(),
        })
    }
}

/// One peer's server endpoint: dispatches its decoded messages, tracks its
/// live subscriptions, and owns its replay log. Carriers drive it with one
/// `handle_message` call per inbound frame, in arrival order.
pub struct ServerEndpoint {
    router: Arc<dyn Router>,
    wire: Arc<dyn ServerWire>,
    registry: SubscriptionRegistry,
    history: Arc<UpdateHistory>,
    // Subscription id -> path, for resolving replay requests.
    topics: Mutex<HashMap<Id, String>>,
}

impl ServerEndpoint {
    pub fn new(
        router: Arc<dyn Router>,
        wire: Arc<dyn ServerWire>,
        history: Arc<UpdateHistory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            wire,
            registry: SubscriptionRegistry::new(),
            history,
            topics: Mutex::new(HashMap::new()),
        })
    }

    pub fn history(&self) -> &Arc<UpdateHistory> {
        &self.history
    }

    pub fn active_subscriptions(&self) -> usize {
        self.registry.len()
    }

    pub async fn handle_message(&self, message: ClientMessage) {
        match message {
            ClientMessage::Call {
                kind,
                id,
                path,
                input,
            } => {
                let result = match self.router.handle_call(kind, &path, input).await {
                    Ok(value) => CallResult::Data { value },
                    Err(error) => CallResult::Error { error },
                };
                if let Err(err) = self.wire.send(&ServerMessage::Result { id, result }) {
                    warn!(
                        target = "wavelink::server",
                        path,
                        error = %err,
                        "failed to send call result"
                    );
                }
            }
            ClientMessage::Subscribe { id, path, input } => {
                let publisher = Publisher {
                    id: id.clone(),
                    topic: path.clone(),
                    wire: self.wire.clone(),
                    history: self.history.clone(),
                };
                match self.router.handle_subscribe(&path, input, publisher).await {
                    Ok(cleanup) => {
                        self.topics.lock().insert(id.clone(), path);
                        self.registry.register(id, cleanup).await;
                    }
                    Err(error) => {
                        debug!(
                            target = "wavelink::server",
                            id = %id,
                            path,
                            "subscribe rejected by router"
                        );
                        if let Err(err) = self.wire.send(&ServerMessage::Error { id, error }) {
                            warn!(
                                target = "wavelink::server",
                                error = %err,
                                "failed to send subscribe rejection"
                            );
                        }
                    }
                }
            }
            ClientMessage::Unsubscribe { id } => {
                self.topics.lock().remove(&id);
                self.registry.deregister(&id).await;
            }
            ClientMessage::RequestMissing {
                id,
                from_seq,
                to_seq,
            } => {
                let topic = self.topics.lock().get(&id).cloned();
                let Some(topic) = topic else {
                    warn!(
                        target = "wavelink::server",
                        id = %id,
                        "replay request for unknown subscription"
                    );
                    return;
                };
                let replay = self.history.range(&topic, from_seq, to_seq);
                debug!(
                    target = "wavelink::server",
                    id = %id,
                    topic,
                    from_seq,
                    to_seq,
                    count = replay.len(),
                    "replaying missed updates"
                );
                for mut entry in replay {
                    // The log is keyed by topic; retarget each entry at the
                    // requesting subscription.
                    entry.id = id.clone();
                    if let Err(err) = self.wire.send(&ServerMessage::Data(entry)) {
                        warn!(
                            target = "wavelink::server",
                            id = %id,
                            error = %err,
                            "failed to send replayed update"
                        );
                        break;
                    }
                }
            }
        }
    }

    /// Confirms a mutation's committed sequence out of band.
    pub fn send_ack(
        &self,
        id: Id,
        client_seq: u64,
        server_seq: u64,
    ) -> Result<(), TransportError> {
        self.wire.send(&ServerMessage::Ack {
            id,
            client_seq,
            server_seq,
        })
    }

    /// Server-initiated completion of one subscription: deregisters it, runs
    /// its cleanup, and notifies the peer.
    pub async fn end_subscription(&self, id: &Id) {
        self.topics.lock().remove(id);
        self.registry.deregister(id).await;
        if let Err(err) = self.wire.send(&ServerMessage::End { id: id.clone() }) {
            warn!(
                target = "wavelink::server",
                id = %id,
                error = %err,
                "failed to send subscription end"
            );
        }
    }

    /// Connection teardown: runs every registered cleanup. The peer is gone,
    /// so no frames are sent.
    pub async fn shutdown(&self) {
        self.topics.lock().clear();
        self.registry.drain().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct CapturingWire {
        sent: Mutex<Vec<ServerMessage>>,
    }

    impl CapturingWire {
        fn sent(&self) -> Vec<ServerMessage> {
            self.sent.lock().clone()
        }
    }

    impl ServerWire for CapturingWire {
        fn send(&self, message: &ServerMessage) -> Result<(), TransportError> {
            self.sent.lock().push(message.clone());
            Ok(())
        }
    }

    struct CounterRouter {
        count: Mutex<i64>,
    }

    #[async_trait]
    impl Router for CounterRouter {
        async fn handle_call(
            &self,
            kind: CallKind,
            path: &str,
            input: Option<Value>,
        ) -> Result<Value, Value> {
            match (kind, path) {
                (CallKind::Query, "getCount") => Ok(json!(*self.count.lock())),
                (CallKind::Mutation, "setCount") => {
                    let value = input
                        .as_ref()
                        .and_then(Value::as_i64)
                        .ok_or_else(|| json!({ "message": "setCount needs a number" }))?;
                    *self.count.lock() = value;
                    Ok(json!(value))
                }
                _ => Err(json!({ "message": format!("unknown path: {path}") })),
            }
        }

        async fn handle_subscribe(
            &self,
            path: &str,
            _input: Option<Value>,
            publisher: Publisher,
        ) -> Result<Cleanup, Value> {
            if path != "onCountUpdate" {
                return Err(json!({ "message": format!("unknown path: {path}") }));
            }
            publisher
                .publish(json!(*self.count.lock()), 1, None)
                .map_err(|err| json!({ "message": err.to_string() }))?;
            Ok(Cleanup::noop())
        }
    }

    fn endpoint() -> (Arc<ServerEndpoint>, Arc<CapturingWire>) {
        let wire = Arc::new(CapturingWire::default());
        let endpoint = ServerEndpoint::new(
            Arc::new(CounterRouter {
                count: Mutex::new(0),
            }),
            wire.clone(),
            Arc::new(UpdateHistory::default()),
        );
        (endpoint, wire)
    }

    #[tokio::test]
    async fn call_produces_one_result() {
        let (endpoint, wire) = endpoint();
        endpoint
            .handle_message(ClientMessage::Call {
                kind: CallKind::Mutation,
                id: Id::Num(1),
                path: "setCount".into(),
                input: Some(json!(5)),
            })
            .await;
        endpoint
            .handle_message(ClientMessage::Call {
                kind: CallKind::Query,
                id: Id::Num(2),
                path: "getCount".into(),
                input: None,
            })
            .await;

        let sent = wire.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(
            &sent[1],
            ServerMessage::Result {
                id: Id::Num(2),
                result: CallResult::Data { value },
            } if *value == json!(5)
        ));
    }

    #[tokio::test]
    async fn unknown_call_path_yields_error_result() {
        let (endpoint, wire) = endpoint();
        endpoint
            .handle_message(ClientMessage::Call {
                kind: CallKind::Query,
                id: Id::Num(1),
                path: "nope".into(),
                input: None,
            })
            .await;
        assert!(matches!(
            &wire.sent()[0],
            ServerMessage::Result {
                result: CallResult::Error { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn subscribe_registers_and_publishes() {
        let (endpoint, wire) = endpoint();
        endpoint
            .handle_message(ClientMessage::Subscribe {
                id: Id::Num(10),
                path: "onCountUpdate".into(),
                input: None,
            })
            .await;

        assert_eq!(endpoint.active_subscriptions(), 1);
        assert!(matches!(&wire.sent()[0], ServerMessage::Data(data) if data.server_seq == 1));
        assert_eq!(endpoint.history().last_seq("onCountUpdate"), Some(1));

        endpoint
            .handle_message(ClientMessage::Unsubscribe { id: Id::Num(10) })
            .await;
        assert_eq!(endpoint.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn rejected_subscribe_sends_error_and_registers_nothing() {
        let (endpoint, wire) = endpoint();
        endpoint
            .handle_message(ClientMessage::Subscribe {
                id: Id::Num(10),
                path: "nope".into(),
                input: None,
            })
            .await;
        assert_eq!(endpoint.active_subscriptions(), 0);
        assert!(matches!(
            &wire.sent()[0],
            ServerMessage::Error { id: Id::Num(10), .. }
        ));
    }

    #[tokio::test]
    async fn replay_retargets_history_at_the_requester() {
        let (endpoint, wire) = endpoint();
        endpoint
            .handle_message(ClientMessage::Subscribe {
                id: Id::Num(10),
                path: "onCountUpdate".into(),
                input: None,
            })
            .await;
        // Publish two more updates directly into the log and wire.
        for seq in 2..=3u64 {
            let message = SubscriptionData {
                id: Id::Num(10),
                data: json!(seq),
                server_seq: seq,
                prev_server_seq: Some(seq - 1),
            };
            endpoint.history().record("onCountUpdate", &message);
        }

        endpoint
            .handle_message(ClientMessage::RequestMissing {
                id: Id::Num(10),
                from_seq: 1,
                to_seq: 3,
            })
            .await;

        let replayed: Vec<u64> = wire
            .sent()
            .iter()
            .skip(1)
            .filter_map(|m| match m {
                ServerMessage::Data(data) => {
                    assert_eq!(data.id, Id::Num(10));
                    Some(data.server_seq)
                }
                _ => None,
            })
            .collect();
        assert_eq!(replayed, vec![2, 3]);
    }

    #[tokio::test]
    async fn replay_for_unknown_subscription_sends_nothing() {
        let (endpoint, wire) = endpoint();
        endpoint
            .handle_message(ClientMessage::RequestMissing {
                id: Id::Num(99),
                from_seq: 0,
                to_seq: 10,
            })
            .await;
        assert!(wire.sent().is_empty());
    }

    #[tokio::test]
    async fn end_subscription_notifies_and_cleans_up() {
        let (endpoint, wire) = endpoint();
        endpoint
            .handle_message(ClientMessage::Subscribe {
                id: Id::Num(10),
                path: "onCountUpdate".into(),
                input: None,
            })
            .await;
        endpoint.end_subscription(&Id::Num(10)).await;
        assert_eq!(endpoint.active_subscriptions(), 0);
        assert!(matches!(
            wire.sent().last(),
            Some(ServerMessage::End { id: Id::Num(10) })
        ));
    }

    #[tokio::test]
    async fn shutdown_drains_without_sending() {
        let (endpoint, wire) = endpoint();
        endpoint
            .handle_message(ClientMessage::Subscribe {
                id: Id::Num(10),
                path: "onCountUpdate".into(),
                input: None,
            })
            .await;
        let frames_before = wire.sent().len();
        endpoint.shutdown().await;
        assert_eq!(endpoint.active_subscriptions(), 0);
        assert_eq!(wire.sent().len(), frames_before);
    }
}

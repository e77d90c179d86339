//! In-process carrier: both ends live in the same process and exchange
//! decoded messages directly over unbounded channels, with no serialization
//! step. Primarily for tests and host-embedded services.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;
use wavelink_proto::{ClientMessage, ServerMessage};

use crate::history::{UpdateHistory, DEFAULT_HISTORY_LIMIT};
use crate::server::{Router, ServerEndpoint, ServerWire};
use crate::transport::{ClientTransport, LinkCore, TransportError, TransportKind, Wire};

pub struct ChannelPair {
    pub client: ClientTransport,
    pub server: Arc<ServerEndpoint>,
}

struct ClientSide {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl Wire for ClientSide {
    fn send(&self, message: &ClientMessage) -> Result<(), TransportError> {
        self.tx
            .send(message.clone())
            .map_err(|_| TransportError::ChannelClosed)
    }
}

struct ServerSide {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ServerWire for ServerSide {
    fn send(&self, message: &ServerMessage) -> Result<(), TransportError> {
        self.tx
            .send(message.clone())
            .map_err(|_| TransportError::ChannelClosed)
    }
}

pub fn pair(router: Arc<dyn Router>) -> ChannelPair {
    pair_with_history(router, DEFAULT_HISTORY_LIMIT)
}

/// Builds a connected client/server pair sharing the current runtime. The
/// server processes messages sequentially in arrival order; the client's
/// pump drives the demultiplexer the same way.
pub fn pair_with_history(router: Arc<dyn Router>, history_limit: usize) -> ChannelPair {
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let (server_tx, mut server_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let core = LinkCore::new(TransportKind::Channel, Box::new(ClientSide { tx: client_tx }));
    let endpoint = ServerEndpoint::new(
        router,
        Arc::new(ServerSide { tx: server_tx }),
        Arc::new(UpdateHistory::new(history_limit)),
    );

    // The server loop runs detached, not in the client's abort list: it has
    // to outlive a dropped client so it can observe the closed channel and
    // run the shutdown drain.
    {
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            while let Some(message) = client_rx.recv().await {
                endpoint.handle_message(message).await;
            }
            debug!(target = "wavelink::channel", "client side closed; shutting down");
            endpoint.shutdown().await;
        });
    }
    let client_pump = {
        let core = core.clone();
        tokio::spawn(async move {
            while let Some(message) = server_rx.recv().await {
                core.handle_message(message);
            }
            core.disconnect("channel closed");
        })
    };

    core.mark_connected();
    ChannelPair {
        client: ClientTransport::new(core, vec![client_pump]),
        server: endpoint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Cleanup;
    use crate::server::Publisher;
    use crate::transport::{ProcedureCall, SubscribeRequest, Transport};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::time::Duration;
    use wavelink_proto::CallKind;

    struct EchoRouter;

    #[async_trait]
    impl Router for EchoRouter {
        async fn handle_call(
            &self,
            _kind: CallKind,
            path: &str,
            input: Option<Value>,
        ) -> Result<Value, Value> {
            match path {
                "echo" => Ok(input.unwrap_or(Value::Null)),
                _ => Err(json!({ "message": "unknown path" })),
            }
        }

        async fn handle_subscribe(
            &self,
            _path: &str,
            _input: Option<Value>,
            _publisher: Publisher,
        ) -> Result<Cleanup, Value> {
            Ok(Cleanup::noop())
        }
    }

    #[tokio::test]
    async fn call_round_trips_without_serialization() {
        let pair = pair(Arc::new(EchoRouter));
        assert!(pair.client.connected());
        let value = pair
            .client
            .request(ProcedureCall::query("echo").with_input(json!({ "n": 1 })))
            .await
            .unwrap();
        assert_eq!(value, json!({ "n": 1 }));
    }

    struct FlagRouter {
        cleaned: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Router for FlagRouter {
        async fn handle_call(
            &self,
            _kind: CallKind,
            _path: &str,
            input: Option<Value>,
        ) -> Result<Value, Value> {
            Ok(input.unwrap_or(Value::Null))
        }

        async fn handle_subscribe(
            &self,
            _path: &str,
            _input: Option<Value>,
            _publisher: Publisher,
        ) -> Result<Cleanup, Value> {
            let cleaned = self.cleaned.clone();
            Ok(Cleanup::from_fn(move || {
                cleaned.store(true, AtomicOrdering::SeqCst);
                Ok(())
            }))
        }
    }

    #[tokio::test]
    async fn client_drop_runs_server_cleanups() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let pair = pair(Arc::new(FlagRouter {
            cleaned: cleaned.clone(),
        }));
        let server = pair.server.clone();

        // Held across the drop so no unsubscribe frame is ever sent; only
        // the shutdown drain may run this cleanup.
        let _subscription = pair.client.subscribe(SubscribeRequest::new("onTick")).unwrap();
        // Round-trip a call so the subscribe is registered before the drop.
        pair.client
            .request(ProcedureCall::query("echo"))
            .await
            .unwrap();
        assert_eq!(server.active_subscriptions(), 1);

        drop(pair.client);

        // The detached server loop observes the closed channel and drains.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cleaned.load(AtomicOrdering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("server cleanups never ran after client drop");
        assert_eq!(server.active_subscriptions(), 0);
    }
}

//! Client/server flows over the Unix-socket IPC carrier.
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::timeout;
use wavelink::proto::CallKind;
use wavelink::transport::ipc;
use wavelink::{
    Cleanup, ProcedureCall, Publisher, Router, SubscribeRequest, SubscriptionItem, Transport,
    TransportError, DEFAULT_HISTORY_LIMIT,
};

const WAIT: Duration = Duration::from_secs(5);

struct PingService;

#[async_trait]
impl Router for PingService {
    async fn handle_call(
        &self,
        _kind: CallKind,
        path: &str,
        input: Option<Value>,
    ) -> Result<Value, Value> {
        match path {
            "ping" => Ok(json!({ "pong": input })),
            _ => Err(json!({ "message": format!("unknown path: {path}") })),
        }
    }

    async fn handle_subscribe(
        &self,
        path: &str,
        _input: Option<Value>,
        publisher: Publisher,
    ) -> Result<Cleanup, Value> {
        if path != "onTick" {
            return Err(json!({ "message": format!("unknown path: {path}") }));
        }
        for seq in 1..=3u64 {
            publisher
                .publish(json!(seq), seq, seq.checked_sub(1).filter(|p| *p > 0))
                .map_err(|err| json!({ "message": err.to_string() }))?;
        }
        publisher
            .end()
            .map_err(|err| json!({ "message": err.to_string() }))?;
        Ok(Cleanup::noop())
    }
}

#[tokio::test]
async fn call_round_trips_over_the_socket_pair() {
    let pair = ipc::pair(Arc::new(PingService), DEFAULT_HISTORY_LIMIT).unwrap();
    let value = pair
        .client
        .request(ProcedureCall::query("ping").with_input(json!(1)))
        .await
        .unwrap();
    assert_eq!(value, json!({ "pong": 1 }));
}

#[tokio::test]
async fn finite_stream_ends_after_its_updates() {
    let pair = ipc::pair(Arc::new(PingService), DEFAULT_HISTORY_LIMIT).unwrap();
    let mut subscription = pair
        .client
        .subscribe(SubscribeRequest::new("onTick"))
        .unwrap();

    for expected in 1..=3u64 {
        match timeout(WAIT, subscription.recv()).await.unwrap() {
            Some(SubscriptionItem::Data(update)) => {
                assert_eq!(update.server_seq, expected);
                assert_eq!(update.data, json!(expected));
            }
            other => panic!("expected data item, got {other:?}"),
        }
    }
    assert_eq!(timeout(WAIT, subscription.recv()).await.unwrap(), None);
}

#[tokio::test]
async fn dropping_the_client_tears_down_the_server() {
    let pair = ipc::pair(Arc::new(PingService), DEFAULT_HISTORY_LIMIT).unwrap();
    let server = pair.server.clone();
    let client = pair.client;
    match client.request(ProcedureCall::query("nope")).await {
        Err(TransportError::Remote(_)) => {}
        other => panic!("expected remote error, got {other:?}"),
    }

    let subscription = client.subscribe(SubscribeRequest::new("onTick")).unwrap();
    client
        .request(ProcedureCall::query("ping"))
        .await
        .unwrap();
    assert_eq!(server.active_subscriptions(), 1);

    drop(subscription);
    drop(client);
    // The server's read loop observes the closed socket and drains.
    timeout(WAIT, async {
        while server.active_subscriptions() > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

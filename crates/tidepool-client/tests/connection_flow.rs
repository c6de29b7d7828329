//! End-to-end connection tests over an in-process transport.
//!
//! Each test pairs a real [`Connection`] with a scripted server on the
//! other end of a duplex pipe, exercising the handshake, subscription
//! loading, live update routing, reducer outcomes, and disconnect
//! behavior without a network.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tidepool_client::{
    ClientError, ClientMessage, Connection, MirrorState, RowChange, RowSink, TableMirror,
};
use tidepool_client::{Card, CardStatus};
use tokio::io::DuplexStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;
use uuid::Uuid;

/// A scripted peer driving the server end of the pipe.
struct FakeServer {
    ws: WebSocketStream<DuplexStream>,
}

impl FakeServer {
    async fn send(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string()))
            .await
            .expect("server send failed");
    }

    /// Next decoded client message, skipping control frames.
    async fn recv(&mut self) -> ClientMessage {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text).expect("client sent invalid JSON");
                }
                Some(Ok(_)) => continue,
                other => panic!("client side ended unexpectedly: {other:?}"),
            }
        }
    }

    async fn greet(&mut self, identity_hex: &str, token: &str) {
        self.send(json!({
            "type": "identity_token",
            "identity": identity_hex,
            "token": token,
            "connection_id": Uuid::new_v4(),
        }))
        .await;
    }
}

/// Wire up both ends of an in-process WebSocket.
async fn ws_pair() -> (WebSocketStream<DuplexStream>, FakeServer) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let client_ws = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
    let server_ws = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
    (client_ws, FakeServer { ws: server_ws })
}

/// Greeted connection plus the server to script against it.
async fn connected_pair() -> (Connection, FakeServer) {
    let (client_ws, mut server) = ws_pair().await;
    server.greet(&"bb".repeat(32), "tok-1").await;
    let conn = Connection::from_socket(client_ws, None)
        .await
        .expect("handshake failed");
    (conn, server)
}

fn card_json(card_id: u64, board_id: u64, title: &str, status: &str, position: u32) -> Value {
    json!({
        "cardId": card_id,
        "boardId": board_id,
        "title": title,
        "status": status,
        "assignee": null,
        "position": position,
        "createdAt": "2025-06-01T12:00:00Z",
    })
}

#[tokio::test]
async fn test_handshake_establishes_session() {
    let (conn, _server) = connected_pair().await;

    assert_eq!(conn.identity().to_hex(), "bb".repeat(32));
    assert_eq!(conn.token(), "tok-1");
    assert!(conn.is_connected());
}

#[tokio::test]
async fn test_handshake_rejects_wrong_first_message() {
    let (client_ws, mut server) = ws_pair().await;
    server
        .send(json!({
            "type": "subscribe_error",
            "sub_id": 1,
            "message": "out of order",
        }))
        .await;

    let result = Connection::from_socket(client_ws, None).await;
    assert!(matches!(result, Err(ClientError::Handshake(_))));
}

#[tokio::test]
async fn test_subscribe_loads_rows_before_returning() {
    let (conn, mut server) = connected_pair().await;
    let mirror: Arc<TableMirror<Card>> = Arc::new(TableMirror::new());
    assert_eq!(mirror.state(), MirrorState::Pending);

    let server_task = tokio::spawn(async move {
        let msg = server.recv().await;
        let ClientMessage::Subscribe { sub_id, queries } = msg else {
            panic!("expected subscribe, got {msg:?}");
        };
        assert_eq!(queries, vec!["SELECT * FROM card WHERE board_id = 7"]);
        server
            .send(json!({
                "type": "subscribe_applied",
                "sub_id": sub_id,
                "rows": [{
                    "table": "card",
                    "rows": [
                        card_json(1, 7, "write tests", "todo", 0),
                        card_json(2, 7, "ship it", "in_progress", 1),
                    ],
                }],
            }))
            .await;
        server
    });

    conn.subscribe(
        "board_cards:7",
        vec!["SELECT * FROM card WHERE board_id = 7".to_string()],
        vec![mirror.clone() as Arc<dyn RowSink>],
    )
    .await
    .expect("subscribe failed");

    // The bulk load is readable the moment subscribe returns.
    assert_eq!(mirror.state(), MirrorState::Applied);
    assert_eq!(mirror.len(), 2);
    assert_eq!(mirror.get(&2).unwrap().status, CardStatus::InProgress);

    server_task.await.unwrap();
}

#[tokio::test]
async fn test_subscribe_rejection_flags_consumer_only() {
    let (conn, mut server) = connected_pair().await;
    let mirror: Arc<TableMirror<Card>> = Arc::new(TableMirror::new());

    let server_task = tokio::spawn(async move {
        let msg = server.recv().await;
        let ClientMessage::Subscribe { sub_id, .. } = msg else {
            panic!("expected subscribe, got {msg:?}");
        };
        server
            .send(json!({
                "type": "subscribe_error",
                "sub_id": sub_id,
                "message": "no such table",
            }))
            .await;
        server
    });

    let result = conn
        .subscribe(
            "board_cards:7",
            vec!["SELECT * FROM nothing".to_string()],
            vec![mirror.clone() as Arc<dyn RowSink>],
        )
        .await;

    match result {
        Err(ClientError::Subscription { key, message }) => {
            assert_eq!(key, "board_cards:7");
            assert_eq!(message, "no such table");
        }
        other => panic!("expected subscription error, got {other:?}"),
    }

    // The failure is scoped to that consumer; the session survives.
    assert_eq!(mirror.state(), MirrorState::Failed);
    assert!(conn.is_connected());

    let mut server = server_task.await.unwrap();

    // A fresh subscribe on the same session still works.
    let retry: Arc<TableMirror<Card>> = Arc::new(TableMirror::new());
    let server_task = tokio::spawn(async move {
        let msg = server.recv().await;
        let ClientMessage::Subscribe { sub_id, .. } = msg else {
            panic!("expected subscribe, got {msg:?}");
        };
        server
            .send(json!({
                "type": "subscribe_applied",
                "sub_id": sub_id,
                "rows": [{ "table": "card", "rows": [] }],
            }))
            .await;
    });

    conn.subscribe(
        "board_cards:8",
        vec!["SELECT * FROM card WHERE board_id = 8".to_string()],
        vec![retry.clone() as Arc<dyn RowSink>],
    )
    .await
    .expect("retry subscribe failed");
    assert_eq!(retry.state(), MirrorState::Applied);

    server_task.await.unwrap();
}

#[tokio::test]
async fn test_live_updates_route_to_mirror() {
    let (conn, mut server) = connected_pair().await;
    let mirror: Arc<TableMirror<Card>> = Arc::new(TableMirror::new());
    let mut changes = mirror.changes();

    let server_task = tokio::spawn(async move {
        let msg = server.recv().await;
        let ClientMessage::Subscribe { sub_id, .. } = msg else {
            panic!("expected subscribe, got {msg:?}");
        };
        server
            .send(json!({
                "type": "subscribe_applied",
                "sub_id": sub_id,
                "rows": [{ "table": "card", "rows": [card_json(1, 7, "first", "todo", 0)] }],
            }))
            .await;
        server
            .send(json!({
                "type": "transaction_update",
                "tables": [{
                    "sub_id": sub_id,
                    "table": "card",
                    "ops": [
                        { "op": "insert", "row": card_json(2, 7, "second", "todo", 1) },
                        { "op": "update", "row": card_json(1, 7, "first", "done", 0) },
                    ],
                }],
            }))
            .await;
    });

    conn.subscribe(
        "board_cards:7",
        vec!["SELECT * FROM card WHERE board_id = 7".to_string()],
        vec![mirror.clone() as Arc<dyn RowSink>],
    )
    .await
    .expect("subscribe failed");

    // Applied marker first, then the inserts and updates in server order.
    assert!(matches!(changes.recv().await.unwrap(), RowChange::Applied));
    let inserted = changes.recv().await.unwrap();
    match inserted {
        RowChange::Inserted(card) => assert_eq!(card.card_id, 2),
        other => panic!("expected insert, got {other:?}"),
    }
    let updated = changes.recv().await.unwrap();
    match updated {
        RowChange::Updated(card) => {
            assert_eq!(card.card_id, 1);
            assert_eq!(card.status, CardStatus::Done);
        }
        other => panic!("expected update, got {other:?}"),
    }

    assert_eq!(mirror.len(), 2);
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_reducer_commit_and_failure() {
    let (conn, mut server) = connected_pair().await;

    let server_task = tokio::spawn(async move {
        for _ in 0..2 {
            let msg = server.recv().await;
            let ClientMessage::CallReducer {
                request_id,
                reducer,
                args,
            } = msg
            else {
                panic!("expected call_reducer, got {msg:?}");
            };
            match reducer.as_str() {
                "create_card" => {
                    assert_eq!(args["title"], "new card");
                    server
                        .send(json!({
                            "type": "reducer_result",
                            "request_id": request_id,
                            "status": { "type": "committed" },
                        }))
                        .await;
                }
                "delete_board" => {
                    server
                        .send(json!({
                            "type": "reducer_result",
                            "request_id": request_id,
                            "status": { "type": "failed", "message": "not the owner" },
                        }))
                        .await;
                }
                other => panic!("unexpected reducer {other}"),
            }
        }
    });

    conn.call_reducer("create_card", json!({ "boardId": 7, "title": "new card" }))
        .await
        .expect("committed call failed");

    let denied = conn.call_reducer("delete_board", json!({ "boardId": 7 })).await;
    match denied {
        Err(ClientError::Reducer { reducer, message }) => {
            assert_eq!(reducer, "delete_board");
            assert_eq!(message, "not the owner");
        }
        other => panic!("expected reducer error, got {other:?}"),
    }

    server_task.await.unwrap();
}

#[tokio::test]
async fn test_connection_loss_fails_pending_calls() {
    let (conn, mut server) = connected_pair().await;

    let server_task = tokio::spawn(async move {
        // Read the call, then vanish without answering.
        let _ = server.recv().await;
    });

    let result = conn.call_reducer("create_board", json!({ "name": "x" })).await;
    assert!(matches!(result, Err(ClientError::ConnectionClosed)));

    server_task.await.unwrap();

    // Liveness flips, and later calls fail fast.
    let mut connected = conn.connected();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *connected.borrow_and_update() {
            if connected.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .expect("connection never observed the drop");

    assert!(!conn.is_connected());
    let after = conn.call_reducer("create_board", json!({ "name": "y" })).await;
    assert!(matches!(after, Err(ClientError::NotConnected)));
}

#[tokio::test]
async fn test_unsubscribe_stops_routing() {
    let (conn, mut server) = connected_pair().await;
    let mirror: Arc<TableMirror<Card>> = Arc::new(TableMirror::new());

    let server_task = tokio::spawn(async move {
        let msg = server.recv().await;
        let ClientMessage::Subscribe { sub_id, .. } = msg else {
            panic!("expected subscribe, got {msg:?}");
        };
        server
            .send(json!({
                "type": "subscribe_applied",
                "sub_id": sub_id,
                "rows": [{ "table": "card", "rows": [card_json(1, 7, "only", "todo", 0)] }],
            }))
            .await;

        let msg = server.recv().await;
        assert!(matches!(msg, ClientMessage::Unsubscribe { sub_id: id } if id == sub_id));

        // An update for the dead subscription, then a reducer round-trip
        // as an ordering fence.
        server
            .send(json!({
                "type": "transaction_update",
                "tables": [{
                    "sub_id": sub_id,
                    "table": "card",
                    "ops": [{ "op": "insert", "row": card_json(99, 7, "ghost", "todo", 9) }],
                }],
            }))
            .await;

        let msg = server.recv().await;
        let ClientMessage::CallReducer { request_id, .. } = msg else {
            panic!("expected call_reducer, got {msg:?}");
        };
        server
            .send(json!({
                "type": "reducer_result",
                "request_id": request_id,
                "status": { "type": "committed" },
            }))
            .await;
    });

    let ticket = conn
        .subscribe(
            "board_cards:7",
            vec!["SELECT * FROM card WHERE board_id = 7".to_string()],
            vec![mirror.clone() as Arc<dyn RowSink>],
        )
        .await
        .expect("subscribe failed");
    assert_eq!(mirror.len(), 1);

    conn.unsubscribe(ticket);
    conn.call_reducer("noop", json!({})).await.expect("fence call failed");

    // The ghost insert arrived before the fence reply and was dropped.
    assert_eq!(mirror.len(), 1);
    assert!(mirror.get(&99).is_none());

    server_task.await.unwrap();
}

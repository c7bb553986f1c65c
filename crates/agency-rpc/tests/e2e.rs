//! End-to-end tests running a real server and client over loopback sockets.

use agency_rpc::{
    authenticator_fn, CallOptions, ClientConfig, ClientEvent, ErrorCode, Identity,
    NotificationHandler, NotifyOptions, RpcClient, RpcError, RpcServer, Scopes, ServerConfig,
    ServerEvent, ServerHandle,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

fn server(config: ServerConfig) -> RpcServer {
    let server = RpcServer::new(config).with_authenticator(authenticator_fn(
        |credentials: Value| async move {
            match credentials["token"].as_str() {
                Some("alice-token") => Some(Identity::new(
                    "alice",
                    Scopes::from_iter(["execution", "rule"]),
                )),
                Some("bob-token") => Some(Identity::new("bob", Scopes::from_iter(["execution"]))),
                Some("numbered-token") => {
                    Some(Identity::new("42", Scopes::from_iter(["execution"])))
                }
                Some("service-token") => {
                    Some(Identity::new("worker", Scopes::from_iter(["service"])))
                }
                _ => None,
            }
        },
    ));

    server
        .register_method("delay", Scopes::open(), |params, _ctx| async move {
            let ms = params
                .as_ref()
                .and_then(|p| p.get(0))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(ms))
        })
        .unwrap();
    server
        .register_method("whoami", Scopes::open(), |_params, ctx| async move {
            Ok(json!(ctx.user))
        })
        .unwrap();
    server
        .register_method("rule.list", Scopes::from_iter(["rule"]), |_params, _ctx| async move {
            Ok(json!(["r1", "r2"]))
        })
        .unwrap();
    server
        .register_notification("execution", Scopes::from_iter(["execution"]))
        .unwrap();
    server
}

async fn listen(server: &RpcServer) -> ServerHandle {
    server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap()
}

fn client_config() -> ClientConfig {
    ClientConfig {
        call_timeout: WAIT,
        ..ClientConfig::default()
    }
}

async fn connect(handle: &ServerHandle, config: ClientConfig) -> RpcClient {
    let client = RpcClient::new(format!("ws://{}", handle.addr()), config);
    client.connect().await.unwrap();
    client
}

async fn wait_for<T, F>(rx: &mut broadcast::Receiver<T>, pred: F) -> T
where
    T: Clone,
    F: Fn(&T) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn collector() -> (NotificationHandler, mpsc::UnboundedReceiver<Option<Value>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: NotificationHandler = Arc::new(move |params: Option<Value>| {
        let _ = tx.send(params);
    });
    (handler, rx)
}

#[tokio::test]
async fn test_login_subscribe_and_targeted_notify() {
    let server = server(ServerConfig::default());
    let handle = listen(&server).await;

    let alice = connect(&handle, client_config()).await;
    let identity = alice.auth(json!({"token": "alice-token"})).await.unwrap();
    assert_eq!(identity.user, "alice");
    assert_eq!(alice.identity(), Some(identity));

    let (handler, mut received) = collector();
    alice.subscribe("execution", handler).await.unwrap();
    assert!(server.has_subscribers("execution").unwrap());

    let delivered = server
        .notify(
            "execution",
            Some(json!({"user": "alice", "id": "e1"})),
            NotifyOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);

    let params = tokio::time::timeout(WAIT, received.recv()).await.unwrap().unwrap();
    assert_eq!(params, Some(json!({"user": "alice", "id": "e1"})));

    // Addressed to someone else.
    let delivered = server
        .notify(
            "execution",
            Some(json!({"user": "bob", "id": "e2"})),
            NotifyOptions::default(),
        )
        .await
        .unwrap();
    assert!(delivered.is_empty());

    alice.close().await;
}

#[tokio::test]
async fn test_service_connection_sees_every_user() {
    let server = server(ServerConfig::default());
    let handle = listen(&server).await;

    let worker = connect(&handle, client_config()).await;
    worker.auth(json!({"token": "service-token"})).await.unwrap();
    server
        .register_notification("execution", Scopes::open())
        .unwrap();

    let (handler, mut received) = collector();
    worker.subscribe("execution", handler).await.unwrap();

    let delivered = server
        .notify("execution", Some(json!({"user": "bob"})), NotifyOptions::default())
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);
    assert!(tokio::time::timeout(WAIT, received.recv()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_non_string_user_still_targets() {
    let server = server(ServerConfig::default());
    let handle = listen(&server).await;

    let mut receivers = Vec::new();
    let mut clients = Vec::new();
    for token in ["alice-token", "bob-token", "numbered-token"] {
        let client = connect(&handle, client_config()).await;
        client.auth(json!({ "token": token })).await.unwrap();
        let (handler, rx) = collector();
        client.subscribe("execution", handler).await.unwrap();
        receivers.push(rx);
        clients.push(client);
    }

    let delivered = server
        .notify("execution", Some(json!({"user": 42})), NotifyOptions::default())
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);

    let params = tokio::time::timeout(WAIT, receivers[2].recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(params, Some(json!({"user": 42})));
    assert!(receivers[0].try_recv().is_err());
    assert!(receivers[1].try_recv().is_err());

    let delivered = server
        .notify("execution", Some(json!({"user": {"id": 1}})), NotifyOptions::default())
        .await
        .unwrap();
    assert!(delivered.is_empty());
}

#[tokio::test]
async fn test_subscription_forbidden_without_scope() {
    let server = server(ServerConfig::default());
    let handle = listen(&server).await;

    let client = connect(&handle, client_config()).await;
    let (handler, _received) = collector();

    let err = client.subscribe("execution", handler.clone()).await.unwrap_err();
    match err {
        RpcError::Subscription { name, reason } => {
            assert_eq!(name, "execution");
            assert_eq!(reason, "notification forbidden");
        }
        other => panic!("unexpected error: {other}"),
    }

    let err = client.subscribe("nope", handler).await.unwrap_err();
    assert!(matches!(err, RpcError::Subscription { ref reason, .. } if reason == "notification is not registered"));
    assert!(!server.has_subscribers("execution").unwrap());
}

#[tokio::test]
async fn test_duplicate_subscription_delivers_once() {
    let server = server(ServerConfig::default());
    let handle = listen(&server).await;

    let client = connect(&handle, client_config()).await;
    client.auth(json!({"token": "bob-token"})).await.unwrap();

    let (handler, mut received) = collector();
    client.subscribe("execution", handler.clone()).await.unwrap();
    client.subscribe("execution", handler.clone()).await.unwrap();

    server
        .notify("execution", Some(json!({"n": 1})), NotifyOptions::default())
        .await
        .unwrap();
    assert!(tokio::time::timeout(WAIT, received.recv()).await.unwrap().is_some());
    assert!(tokio::time::timeout(Duration::from_millis(200), received.recv())
        .await
        .is_err());

    client.unsubscribe("execution", &handler).await.unwrap();
    assert!(!server.has_subscribers("execution").unwrap());
}

#[tokio::test]
async fn test_unsubscribing_one_handler_keeps_the_others() {
    let server = server(ServerConfig::default());
    let handle = listen(&server).await;

    let client = connect(&handle, client_config()).await;
    client.auth(json!({"token": "bob-token"})).await.unwrap();

    let (first, mut first_rx) = collector();
    let (second, mut second_rx) = collector();
    client.subscribe("execution", first.clone()).await.unwrap();
    client.subscribe("execution", second.clone()).await.unwrap();

    client.unsubscribe("execution", &first).await.unwrap();
    assert!(server.has_subscribers("execution").unwrap());

    server
        .notify("execution", Some(json!({"n": 1})), NotifyOptions::default())
        .await
        .unwrap();
    assert!(tokio::time::timeout(WAIT, second_rx.recv()).await.unwrap().is_some());
    assert!(first_rx.try_recv().is_err());

    client.unsubscribe("execution", &second).await.unwrap();
    assert!(!server.has_subscribers("execution").unwrap());
}

#[tokio::test]
async fn test_concurrent_calls_are_correlated() {
    let server = server(ServerConfig::default());
    let handle = listen(&server).await;
    let client = connect(&handle, client_config()).await;

    let (slow, fast, medium) = tokio::join!(
        client.call("delay", Some(json!([300])), CallOptions::default()),
        client.call("delay", Some(json!([10])), CallOptions::default()),
        client.call("delay", Some(json!([150])), CallOptions::default()),
    );

    assert_eq!(slow.unwrap(), json!(300));
    assert_eq!(fast.unwrap(), json!(10));
    assert_eq!(medium.unwrap(), json!(150));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_call_times_out() {
    let server = server(ServerConfig::default());
    let handle = listen(&server).await;
    let client = connect(&handle, client_config()).await;

    let err = client
        .call(
            "delay",
            Some(json!([1000])),
            CallOptions::timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout { ref method, .. } if method == "delay"));
    assert_eq!(client.pending_calls(), 0);

    // The connection is still usable; the late response is dropped.
    let result = client
        .call("whoami", None, CallOptions::default())
        .await
        .unwrap();
    assert_eq!(result, json!("anonymous"));
}

#[tokio::test]
async fn test_authorization_and_errors() {
    let server = server(ServerConfig::default());
    let handle = listen(&server).await;
    let client = connect(&handle, client_config()).await;

    let err = client
        .call("rule.list", None, CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.remote().unwrap().kind(), Some(ErrorCode::MethodForbidden));

    let err = client
        .call("missing", None, CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.remote().unwrap().kind(), Some(ErrorCode::MethodNotFound));

    let err = client.auth(json!({"token": "wrong"})).await.unwrap_err();
    assert_eq!(err.remote().unwrap().message, "AuthenticationFailed");
    assert!(client.identity().is_none());

    client.auth(json!({"token": "alice-token"})).await.unwrap();
    let rules = client
        .call("rule.list", None, CallOptions::default())
        .await
        .unwrap();
    assert_eq!(rules, json!(["r1", "r2"]));
}

#[tokio::test]
async fn test_become_other_user() {
    let server = server(ServerConfig::default());
    let handle = listen(&server).await;

    let alice = connect(&handle, client_config()).await;
    alice.auth(json!({"token": "alice-token"})).await.unwrap();
    let err = alice
        .call("whoami", None, CallOptions::become_user("bob"))
        .await
        .unwrap_err();
    assert_eq!(err.remote().unwrap().kind(), Some(ErrorCode::BecomingForbidden));

    let worker = connect(&handle, client_config()).await;
    worker.auth(json!({"token": "service-token"})).await.unwrap();
    let user = worker
        .call("whoami", None, CallOptions::become_user("bob"))
        .await
        .unwrap();
    assert_eq!(user, json!("bob"));
}

#[tokio::test]
async fn test_random_notify_picks_one() {
    let server = server(ServerConfig::default());
    let handle = listen(&server).await;

    let mut receivers = Vec::new();
    let mut clients = Vec::new();
    for _ in 0..3 {
        let client = connect(&handle, client_config()).await;
        client.auth(json!({"token": "bob-token"})).await.unwrap();
        let (handler, rx) = collector();
        client.subscribe("execution", handler).await.unwrap();
        receivers.push(rx);
        clients.push(client);
    }

    let delivered = server
        .notify("execution", None, NotifyOptions { random: true })
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let got: usize = receivers
        .iter_mut()
        .map(|rx| usize::from(rx.try_recv().is_ok()))
        .sum();
    assert_eq!(got, 1);
}

#[tokio::test]
async fn test_socket_id_is_honored() {
    let server = server(ServerConfig::default());
    let handle = listen(&server).await;
    let mut events = server.events();

    let client = connect(
        &handle,
        ClientConfig {
            socket_id: Some("worker-1".into()),
            ..client_config()
        },
    )
    .await;

    wait_for(&mut events, |e| {
        matches!(e, ServerEvent::Connection { id } if id == "worker-1")
    })
    .await;
    assert!(server.connection_ids().contains(&"worker-1".to_string()));

    client.close().await;
    wait_for(&mut events, |e| {
        matches!(e, ServerEvent::Disconnect { id } if id == "worker-1")
    })
    .await;
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_connect_twice_fails() {
    let server = server(ServerConfig::default());
    let handle = listen(&server).await;
    let client = connect(&handle, client_config()).await;

    assert!(matches!(client.connect().await, Err(RpcError::AlreadyConnected)));
}

#[tokio::test]
async fn test_batch_over_the_wire() {
    let server = server(ServerConfig::default());
    let handle = listen(&server).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", handle.addr()))
        .await
        .unwrap();
    ws.send(Message::Text(
        r#"[
            {"jsonrpc":"2.0","method":"whoami","id":1},
            {"jsonrpc":"2.0","method":"whoami"},
            {"jsonrpc":"2.0","method":"missing","id":2},
            5
        ]"#
        .to_string(),
    ))
    .await
    .unwrap();

    let reply = tokio::time::timeout(WAIT, async {
        loop {
            if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                return text;
            }
        }
    })
    .await
    .unwrap();

    let reply: Value = serde_json::from_str(&reply).unwrap();
    let entries = reply.as_array().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0], json!({"jsonrpc": "2.0", "result": "anonymous", "id": 1}));
    assert_eq!(entries[1]["error"]["code"], -32601);
    assert_eq!(entries[1]["id"], 2);
    assert_eq!(entries[2]["error"]["code"], -32600);
    assert_eq!(entries[2]["id"], Value::Null);
}

#[tokio::test]
async fn test_server_drops_silent_peer() {
    let server = server(ServerConfig {
        ping_interval: Duration::from_millis(100),
        ..ServerConfig::default()
    });
    let handle = listen(&server).await;
    let mut events = server.events();

    // Never polled, so pings go unanswered.
    let (_silent, _) =
        tokio_tungstenite::connect_async(format!("ws://{}/?socket_id=silent", handle.addr()))
            .await
            .unwrap();

    let healthy = connect(&handle, client_config()).await;

    wait_for(&mut events, |e| {
        matches!(e, ServerEvent::Disconnect { id } if id == "silent")
    })
    .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(healthy.is_connected());
    assert_eq!(server.connection_count(), 1);
    let user = healthy
        .call("whoami", None, CallOptions::default())
        .await
        .unwrap();
    assert_eq!(user, json!("anonymous"));
}

#[tokio::test]
async fn test_client_gives_up_without_heartbeat() {
    let server = server(ServerConfig {
        ping_interval: Duration::ZERO,
        ..ServerConfig::default()
    });
    let handle = listen(&server).await;

    let client = RpcClient::new(
        format!("ws://{}", handle.addr()),
        ClientConfig {
            heartbeat_timeout: Duration::from_millis(150),
            ..client_config()
        },
    );
    let mut events = client.events();
    client.connect().await.unwrap();

    wait_for(&mut events, |e| *e == ClientEvent::HeartbeatMissed).await;
    wait_for(&mut events, |e| *e == ClientEvent::Disconnected).await;
    assert!(!client.is_connected());

    let err = client
        .call("whoami", None, CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::NotConnected));
}

#[tokio::test]
async fn test_server_pings_keep_client_alive() {
    let server = server(ServerConfig {
        ping_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    });
    let handle = listen(&server).await;

    let client = connect(
        &handle,
        ClientConfig {
            heartbeat_timeout: Duration::from_millis(400),
            ..client_config()
        },
    )
    .await;

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(client.is_connected());
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_close_rejects_pending_calls() {
    let server = server(ServerConfig::default());
    let handle = listen(&server).await;
    let client = connect(&handle, client_config()).await;

    let call = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .call("delay", Some(json!([10_000])), CallOptions::timeout(Duration::ZERO))
                .await
        }
    });

    tokio::time::timeout(WAIT, async {
        while client.pending_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    client.close().await;
    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, RpcError::ConnectionClosed));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_server_shutdown_disconnects_clients() {
    let server = server(ServerConfig::default());
    let mut handle = listen(&server).await;
    let mut server_events = server.events();

    let client = connect(&handle, client_config()).await;
    let mut client_events = client.events();

    handle.shutdown();
    wait_for(&mut server_events, |e| *e == ServerEvent::Close).await;
    wait_for(&mut client_events, |e| *e == ClientEvent::Disconnected).await;
    assert!(!client.is_connected());
}

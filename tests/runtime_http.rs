// Runtime lifecycle and the HTTP listener's status surface.

mod support;

use std::sync::Arc;
use support::FixedKeyVerifier;

use zeal::config::ServerConfig;
use zeal::runtime::Runtime;

fn ephemeral_config() -> ServerConfig {
    ServerConfig {
        tcp_enabled: true,
        tcp_port: 0,
        http_enabled: true,
        http_port: 0,
        ws_enabled: true,
        ws_port: 0,
        node_name: "node1".into(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_binds_all_enabled_listeners_and_is_idempotent() {
    let runtime = Runtime::new(
        ephemeral_config(),
        Arc::new(FixedKeyVerifier {
            key: "abcdefgh".into(),
        }),
    );

    runtime.start().await.expect("runtime starts");
    runtime.start().await.expect("second start is a no-op");

    let http = runtime.manager().http_local_addr().expect("http bound");
    let tcp = runtime.manager().tcp_local_addr().expect("tcp bound");
    let ws = runtime.manager().ws_local_addr().expect("ws bound");
    assert_ne!(tcp.port(), 0);
    assert_ne!(ws.port(), 0);

    let health = reqwest::get(format!("http://{http}/health"))
        .await
        .expect("health request")
        .text()
        .await
        .expect("health body");
    assert_eq!(health, "ok");

    let status: serde_json::Value = reqwest::get(format!("http://{http}/status"))
        .await
        .expect("status request")
        .json()
        .await
        .expect("status json");
    assert_eq!(status["node"], "node1");
    assert_eq!(status["games"], 1);
    assert_eq!(status["registry"]["size"], 0);
    assert!(status["dispatcher_shards"].as_u64().unwrap() >= 1);

    runtime.stop().await;
    runtime.stop().await;
    assert!(
        reqwest::get(format!("http://{http}/health")).await.is_err(),
        "http listener should be down after stop"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn node_name_prefixes_session_ids() {
    let runtime = Runtime::new(
        ephemeral_config(),
        Arc::new(FixedKeyVerifier {
            key: "abcdefgh".into(),
        }),
    );
    let id = runtime.context().ids.next_id();
    assert_eq!(id.to_string(), "node1-1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_taken_port_fails_startup_loudly() {
    // Occupy a port, then point the TCP listener at it.
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind blocker");
    let port = taken.local_addr().expect("blocker addr").port();

    let config = ServerConfig {
        tcp_enabled: true,
        tcp_port: port,
        http_enabled: false,
        ws_enabled: false,
        ..ephemeral_config()
    };
    let runtime = Runtime::new(
        config,
        Arc::new(FixedKeyVerifier {
            key: "abcdefgh".into(),
        }),
    );
    let started = runtime.start().await;
    assert!(started.is_err(), "bind conflict must fail startup");
    // A later start on a free port still works: the failure rolled back.
    runtime.stop().await;
}

//! Liveness: heartbeat eviction of a dead peer.

use std::time::Duration;

use rivet::{Config, RpcClient, RpcRequest, StatusCode};
use rivet_testkit::{init_tracing, ECHO_CLASS};

/// A peer that accepts and then goes silent: heartbeat probes time out,
/// the miss budget runs dry, and the connection is evicted with its
/// pendings failed.
#[tokio::test]
async fn heartbeat_evicts_dead_peer() {
    init_tracing();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    tokio::spawn(async move {
        let mut parked = Vec::new();
        loop {
            match listener.accept().await {
                Ok((stream, _)) => parked.push(stream),
                Err(_) => return,
            }
        }
    });

    let mut config = Config::from_env();
    config.heartbeat_interval = Duration::from_millis(200);
    config.heartbeat_max_miss = 2;
    let client = RpcClient::with_config(config);
    client.startup().unwrap();

    // Park a long-deadline call so eviction has a pending to fail.
    let future = client
        .invoke_with_future(
            addr.as_str(),
            RpcRequest::json(ECHO_CLASS, "hello?").unwrap(),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

    // Two missed probes at a 200ms interval must evict well within 3s.
    let manager = client.connection_manager().unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while manager.get(&addr).is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "connection never evicted"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let response = future.wait().await.unwrap();
    assert_eq!(response.status, StatusCode::ConnectionClosed);

    client.shutdown();
}

/// A live server keeps answering probes: the miss counter stays at zero
/// and the connection survives many idle intervals.
#[tokio::test]
async fn heartbeats_keep_idle_connection_alive() {
    init_tracing();

    let server = rivet::RpcServer::new(0);
    server.startup().await.unwrap();
    let addr = format!("127.0.0.1:{}", server.local_addr().unwrap().port());

    let mut config = Config::from_env();
    config.heartbeat_interval = Duration::from_millis(100);
    config.heartbeat_max_miss = 2;
    let client = RpcClient::with_config(config);
    client.startup().unwrap();

    // Materialize the pooled connection without registering any processor:
    // heartbeats need no user processor on either side.
    let manager = client.connection_manager().unwrap();
    let url = rivet::Url::parse(&addr, &Config::from_env()).unwrap();
    let conn = manager.get_and_create_if_absent(&url).await.unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(conn.is_active(), "idle connection was dropped");
    assert_eq!(conn.heartbeat_missed(), 0);

    client.shutdown();
    server.shutdown();
}

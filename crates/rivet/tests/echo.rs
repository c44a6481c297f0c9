//! End-to-end request/response scenarios against a real TCP server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rivet::{Config, RemotingError, RpcClient, RpcRequest, RpcServer, StatusCode};
use rivet_testkit::{
    init_tracing, CounterProcessor, EchoProcessor, SleepProcessor, COUNTER_CLASS, ECHO_CLASS,
    SLEEP_CLASS,
};

async fn start_echo_server() -> (RpcServer, String) {
    let server = RpcServer::new(0);
    server.register_processor(Arc::new(EchoProcessor)).unwrap();
    server.startup().await.unwrap();
    let addr = format!("127.0.0.1:{}", server.local_addr().unwrap().port());
    (server, addr)
}

#[tokio::test]
async fn sync_echo() {
    init_tracing();
    let (server, addr) = start_echo_server().await;

    let client = RpcClient::new();
    client.startup().unwrap();

    let response = client
        .invoke_sync(
            addr.as_str(),
            RpcRequest::json(ECHO_CLASS, "hi").unwrap(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    let body: String = response.decode().unwrap();
    assert_eq!(body, "ok:hi");

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn timeout_fires_within_budget() {
    init_tracing();
    let server = RpcServer::new(0);
    server
        .register_processor(Arc::new(SleepProcessor {
            delay: Duration::from_millis(500),
        }))
        .unwrap();
    server.startup().await.unwrap();
    let addr = format!("127.0.0.1:{}", server.local_addr().unwrap().port());

    let client = RpcClient::new();
    client.startup().unwrap();

    let started = Instant::now();
    let err = client
        .invoke_sync(
            addr.as_str(),
            RpcRequest::json(SLEEP_CLASS, "zzz").unwrap(),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, RemotingError::Timeout), "got {err}");
    assert!(
        elapsed >= Duration::from_millis(80) && elapsed <= Duration::from_millis(300),
        "timeout fired after {elapsed:?}"
    );

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn no_processor_registered() {
    init_tracing();
    let server = RpcServer::new(0);
    server.startup().await.unwrap();
    let addr = format!("127.0.0.1:{}", server.local_addr().unwrap().port());

    let client = RpcClient::new();
    client.startup().unwrap();

    let err = client
        .invoke_sync(
            addr.as_str(),
            RpcRequest::json(ECHO_CLASS, "anyone home").unwrap(),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            RemotingError::Remote {
                status: StatusCode::NoProcessor,
                ..
            }
        ),
        "got {err}"
    );

    client.shutdown();
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oneway_reaches_server_without_responses() {
    init_tracing();
    let server = RpcServer::new(0);
    let counter = CounterProcessor::new();
    let hits = counter.hits();
    server.register_processor(Arc::new(counter)).unwrap();
    server.startup().await.unwrap();
    let addr = format!("127.0.0.1:{}", server.local_addr().unwrap().port());

    let client = RpcClient::new();
    client.startup().unwrap();

    const N: u64 = 1000;
    for i in 0..N {
        client
            .oneway(addr.as_str(), RpcRequest::json(COUNTER_CLASS, &i).unwrap())
            .await
            .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while hits.load(std::sync::atomic::Ordering::SeqCst) < N {
        assert!(Instant::now() < deadline, "server never saw all oneways");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // No response frames came back: a response to a oneway would have no
    // pending entry and would bump the discard counter.
    let manager = client.connection_manager().unwrap();
    let conn = manager.get(&addr).unwrap();
    assert_eq!(conn.discarded_responses(), 0);
    assert_eq!(conn.pending_invokes(), 0);

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn v2_crc_end_to_end() {
    init_tracing();
    let (server, addr) = start_echo_server().await;

    let mut config = Config::from_env();
    config.crc_enabled = true;
    let client = RpcClient::with_config(config);
    client.startup().unwrap();

    // Speak v2 to this address; the server answers in kind.
    let addr_v2 = format!("{addr}?_PROTOCOL=2");
    let response = client
        .invoke_sync(
            addr_v2.as_str(),
            RpcRequest::json(ECHO_CLASS, "checked").unwrap(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    let body: String = response.decode().unwrap();
    assert_eq!(body, "ok:checked");

    client.shutdown();
    server.shutdown();
}

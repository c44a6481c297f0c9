//! Lifecycle, callbacks, and late-response handling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use rivet::codec::{self, Decoded};
use rivet::{
    Command, InvokeCallback, RemotingError, ResponseCommand, RpcClient, RpcRequest, RpcServer,
    StatusCode, CODEC_JSON,
};
use rivet_testkit::{init_tracing, EchoProcessor, SleepProcessor, ECHO_CLASS, SLEEP_CLASS};

#[tokio::test]
async fn startup_twice_fails() {
    init_tracing();
    let client = RpcClient::new();
    client.startup().unwrap();
    assert!(matches!(
        client.startup(),
        Err(RemotingError::Lifecycle(_))
    ));
    client.shutdown();
    // Repeated shutdown is safe; restart stays forbidden.
    client.shutdown();
    assert!(matches!(
        client.startup(),
        Err(RemotingError::Lifecycle(_))
    ));
}

#[tokio::test]
async fn shutdown_resolves_pending_futures() {
    init_tracing();
    let server = RpcServer::new(0);
    server
        .register_processor(Arc::new(SleepProcessor {
            delay: Duration::from_secs(5),
        }))
        .unwrap();
    server.startup().await.unwrap();
    let addr = format!("127.0.0.1:{}", server.local_addr().unwrap().port());

    let client = RpcClient::new();
    client.startup().unwrap();
    let future = client
        .invoke_with_future(
            addr.as_str(),
            RpcRequest::json(SLEEP_CLASS, "wait").unwrap(),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

    client.shutdown();
    let response = future.wait().await.unwrap();
    assert_eq!(response.status, StatusCode::ConnectionClosed);

    server.shutdown();
}

#[tokio::test]
async fn callback_style_completes_once() {
    init_tracing();
    let server = RpcServer::new(0);
    server.register_processor(Arc::new(EchoProcessor)).unwrap();
    server.startup().await.unwrap();
    let addr = format!("127.0.0.1:{}", server.local_addr().unwrap().port());

    struct Recorder {
        fired: AtomicBool,
        tx: tokio::sync::mpsc::UnboundedSender<StatusCode>,
    }

    #[async_trait]
    impl InvokeCallback for Recorder {
        async fn on_response(&self, response: ResponseCommand) {
            assert!(
                !self.fired.swap(true, Ordering::SeqCst),
                "callback fired twice"
            );
            let _ = self.tx.send(response.status);
        }
    }

    let client = RpcClient::new();
    client.startup().unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client
        .invoke_with_callback(
            addr.as_str(),
            RpcRequest::json(ECHO_CLASS, "cb").unwrap(),
            Arc::new(Recorder {
                fired: AtomicBool::new(false),
                tx,
            }),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("callback never fired")
        .unwrap();
    assert_eq!(status, StatusCode::Success);

    client.shutdown();
    server.shutdown();
}

/// A peer that answers after the caller's timeout: the late response is
/// dropped silently and only bumps the discard counter.
#[tokio::test]
async fn late_response_is_ignored_silently() {
    init_tracing();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

    tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::with_capacity(4096);

        // Read until one full request frame is in.
        let request = loop {
            stream.read_buf(&mut buf).await.unwrap();
            match codec::decode(&mut buf).unwrap() {
                Decoded::Frame(Command::Request(req)) => break req,
                Decoded::Incomplete => continue,
                other => panic!("unexpected inbound: {other:?}"),
            }
        };

        // Answer well past the caller's 100ms deadline.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let response = ResponseCommand::success(
            request.id,
            request.ver2,
            CODEC_JSON,
            request.class_name.clone(),
            bytes::Bytes::from_static(b"\"too late\""),
        );
        let mut out = BytesMut::new();
        codec::encode(
            &Command::Response(response),
            rivet::ProtocolId::v1(),
            &mut out,
        )
        .unwrap();
        stream.write_all(&out).await.unwrap();
        stream.flush().await.unwrap();
        // Hold the socket open so the client side stays active.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = RpcClient::new();
    client.startup().unwrap();

    let err = client
        .invoke_sync(
            addr.as_str(),
            RpcRequest::json(ECHO_CLASS, "slowpoke").unwrap(),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RemotingError::Timeout), "got {err}");

    // The late answer arrives, is dropped, and leaves the connection healthy.
    let manager = client.connection_manager().unwrap();
    let conn = manager.get(&addr).expect("connection should survive");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while conn.discarded_responses() == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "late response never observed"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(conn.is_active());
    assert_eq!(conn.pending_invokes(), 0);

    client.shutdown();
}

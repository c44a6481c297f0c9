//! Parallel correlation: many tasks share one pool and every response
//! must match its request.

use std::sync::Arc;
use std::time::Duration;

use rivet::{RpcClient, RpcRequest, RpcServer};
use rivet_testkit::{init_tracing, EchoProcessor, ECHO_CLASS};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_calls_stay_correlated() {
    init_tracing();

    let server = RpcServer::new(0);
    server.register_processor(Arc::new(EchoProcessor)).unwrap();
    server.startup().await.unwrap();
    let addr = format!("127.0.0.1:{}", server.local_addr().unwrap().port());

    let client = RpcClient::new();
    client.startup().unwrap();

    const TASKS: usize = 8;
    const CALLS: usize = 250;

    let mut workers = Vec::with_capacity(TASKS);
    for task in 0..TASKS {
        let client = client.clone();
        let addr = addr.clone();
        workers.push(tokio::spawn(async move {
            for call in 0..CALLS {
                let msg = format!("t{task}-c{call}");
                let response = client
                    .invoke_sync(
                        addr.as_str(),
                        RpcRequest::json(ECHO_CLASS, &msg).unwrap(),
                        Duration::from_secs(5),
                    )
                    .await
                    .unwrap();
                let body: String = response.decode().unwrap();
                assert_eq!(body, format!("ok:{msg}"));
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    // No leaked pendings once every call has drained.
    let manager = client.connection_manager().unwrap();
    let conn = manager.get(&addr).expect("pool still live");
    assert_eq!(conn.pending_invokes(), 0);
    assert_eq!(conn.discarded_responses(), 0);

    client.shutdown();
    server.shutdown();
}

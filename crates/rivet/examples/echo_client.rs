//! Minimal echo client: `cargo run --example echo_client`

use std::time::Duration;

use rivet::prelude::*;

#[tokio::main]
async fn main() -> Result<(), RemotingError> {
    tracing_subscriber::fmt::init();

    let client = RpcClient::new();
    client.startup()?;

    let response = client
        .invoke_sync(
            "127.0.0.1:12200",
            RpcRequest::json("Ping", "hello from rivet")?,
            Duration::from_secs(1),
        )
        .await?;
    let body: String = response.decode()?;
    println!("{body}");

    client.shutdown();
    Ok(())
}

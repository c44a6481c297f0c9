//! Minimal echo server: `cargo run --example echo_server`

use std::sync::Arc;

use async_trait::async_trait;
use rivet::prelude::*;

struct Echo;

#[async_trait]
impl UserProcessor for Echo {
    fn interest(&self) -> Vec<String> {
        vec!["Ping".to_string()]
    }

    async fn handle_request(
        &self,
        ctx: AsyncContext,
        request: RequestBody,
    ) -> Result<(), ProcessorError> {
        let msg: String = request.decode()?;
        tracing::info!(%msg, "echoing");
        ctx.send_response(&format!("ok:{msg}"))
            .map_err(|e| ProcessorError::server_error(e.to_string()))
    }
}

#[tokio::main]
async fn main() -> Result<(), RemotingError> {
    tracing_subscriber::fmt::init();

    let server = RpcServer::new(12200);
    server.register_processor(Arc::new(Echo))?;
    server.startup().await?;
    tracing::info!(addr = ?server.local_addr(), "echo server up");

    std::future::pending::<()>().await;
    unreachable!()
}

//! Inbound command routing.
//!
//! Runs on the connection's reader task. Heartbeats are answered inline;
//! responses complete their pending invokes; requests are handed to user
//! processors on an executor so the reader never blocks on user code.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::command::{Command, CommandCode, CommandKind, RequestCommand, ResponseCommand};
use crate::connection::Connection;
use crate::error::{CodecError, StatusCode};
use crate::processor::{AsyncContext, RequestBody, UserProcessor};

pub(crate) async fn handle_inbound(conn: &Connection, cmd: Command) {
    match cmd {
        Command::Request(req) if req.code == CommandCode::Heartbeat => {
            // Answered on the reader task; never requires user dispatch.
            if req.kind != CommandKind::Oneway {
                if let Err(e) = conn.post_response(ResponseCommand::heartbeat_ack(req.id, req.ver2))
                {
                    tracing::debug!(peer = %conn.remote_addr(), error = %e, "heartbeat ack refused");
                }
            }
        }
        Command::Response(resp) => match conn.invokes().remove(resp.id) {
            Some(entry) => {
                entry.complete(resp);
            }
            None => {
                // Late or duplicate response: dropped, counted, never fatal.
                conn.count_discarded_response();
                tracing::debug!(
                    id = resp.id,
                    peer = %conn.remote_addr(),
                    status = %resp.status,
                    "response without pending invoke, dropped"
                );
            }
        },
        Command::Request(req) => dispatch_request(conn, req).await,
    }
}

/// A frame-local codec failure: answer or fail the single frame, keep the
/// stream.
pub(crate) fn handle_corrupt(conn: &Connection, id: u32, kind: CommandKind, error: &CodecError) {
    tracing::warn!(id, ?kind, peer = %conn.remote_addr(), error = %error, "corrupt frame");
    match kind {
        CommandKind::Request => {
            let resp =
                ResponseCommand::failure(id, 1, StatusCode::CodecException, &error.to_string());
            if let Err(e) = conn.post_response(resp) {
                tracing::debug!(id, error = %e, "could not answer corrupt request");
            }
        }
        CommandKind::Oneway => {}
        CommandKind::Response => {
            if let Some(entry) = conn.invokes().remove(id) {
                entry.complete(ResponseCommand::local(id, StatusCode::CodecException));
            } else {
                conn.count_discarded_response();
            }
        }
    }
}

async fn dispatch_request(conn: &Connection, req: RequestCommand) {
    let processors = conn.context().processors.clone();
    let Some(processor) = processors.resolve(&req.class_name) else {
        tracing::warn!(
            class = %req.class_name,
            peer = %conn.remote_addr(),
            "no user processor registered"
        );
        if req.kind != CommandKind::Oneway {
            let resp = ResponseCommand::failure(
                req.id,
                req.ver2,
                StatusCode::NoProcessor,
                &format!("no user processor for class {}", req.class_name),
            );
            if let Err(e) = conn.post_response(resp) {
                tracing::debug!(id = req.id, error = %e, "could not answer unroutable request");
            }
        }
        return;
    };

    let ctx = AsyncContext::new(conn.clone(), &req);
    let body = RequestBody::from_command(&req);
    let task = run_processor(processor.clone(), ctx, body);
    match processor.executor() {
        Some(handle) => {
            handle.spawn(task);
        }
        None => {
            tokio::spawn(task);
        }
    }
}

/// Invoke the processor with panic isolation and map failures onto wire
/// statuses. For oneway requests failures are only logged.
async fn run_processor(processor: Arc<dyn UserProcessor>, ctx: AsyncContext, body: RequestBody) {
    let class = body.class_name().to_string();
    let fut = processor.handle_request(ctx.clone(), body);
    let outcome = AssertUnwindSafe(fut).catch_unwind().await;

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some((e.status, e.message)),
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("processor panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("processor panicked: {s}")
            } else {
                "processor panicked".to_string()
            };
            Some((StatusCode::ServerException, message))
        }
    };

    if let Some((status, message)) = failure {
        if ctx.is_oneway() {
            tracing::warn!(class = %class, %status, message, "oneway processor failed");
        } else if !ctx.responded() {
            if let Err(e) = ctx.send_error(status, &message) {
                tracing::debug!(
                    id = ctx.request_id(),
                    error = %e,
                    "could not send failure response"
                );
            }
        } else {
            tracing::warn!(
                class = %class,
                %status,
                message,
                "processor failed after responding"
            );
        }
    }
}

//! Keep-alive heartbeats and idle eviction.
//!
//! Each connection runs one idle monitor. Clients probe an idle peer with
//! a heartbeat request over the normal invoke plumbing; servers just close
//! connections that stay read-idle. A probe timeout counts as a miss, any
//! successful answer resets the counter, and too many misses close the
//! connection.

use std::time::Duration;

use crate::command::RequestCommand;
use crate::connection::{Connection, Role};
use crate::error::StatusCode;
use crate::invoke::InvokeContext;

/// Upper bound on a single heartbeat round trip.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) fn spawn_idle_monitor(conn: Connection) {
    let ctx = conn.context().clone();
    match ctx.role {
        Role::Client => {
            let interval = conn
                .url()
                .idle_timeout
                .unwrap_or(ctx.config.heartbeat_interval);
            let max_miss = ctx.config.heartbeat_max_miss;
            tokio::spawn(client_monitor(conn, interval, max_miss));
        }
        Role::Server => {
            let interval = conn.url().idle_timeout.unwrap_or(ctx.config.server_idle);
            tokio::spawn(server_monitor(conn, interval));
        }
    }
}

async fn client_monitor(conn: Connection, interval: Duration, max_miss: u32) {
    // Short intervals shorten the probe deadline too, so eviction latency
    // stays proportional to the configured interval.
    let probe_timeout = HEARTBEAT_TIMEOUT.min(interval).max(Duration::from_millis(1));
    let mut closed_rx = conn.closed_watch();
    loop {
        if *closed_rx.borrow() {
            return;
        }
        tokio::select! {
            _ = closed_rx.changed() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if !conn.is_active() {
            return;
        }
        if conn.idle_for() < interval || !conn.heartbeat_enabled() {
            continue;
        }
        probe(&conn, probe_timeout).await;
        if conn.heartbeat_missed() >= max_miss {
            tracing::warn!(
                peer = %conn.remote_addr(),
                missed = conn.heartbeat_missed(),
                "heartbeat budget exhausted, closing connection"
            );
            conn.close();
            return;
        }
    }
}

async fn probe(conn: &Connection, timeout: Duration) {
    let sent = conn.invoke(
        RequestCommand::heartbeat(),
        timeout,
        None,
        InvokeContext::new(),
    );
    match sent {
        Ok(Some(future)) => match future.wait().await {
            Ok(resp) if resp.status == StatusCode::Success => {
                conn.reset_heartbeat_missed();
            }
            Ok(resp) => {
                let missed = conn.record_heartbeat_miss();
                tracing::debug!(
                    peer = %conn.remote_addr(),
                    status = %resp.status,
                    missed,
                    "heartbeat answered with failure"
                );
            }
            Err(e) => {
                let missed = conn.record_heartbeat_miss();
                tracing::debug!(peer = %conn.remote_addr(), error = %e, missed, "heartbeat lost");
            }
        },
        Ok(None) => unreachable!("heartbeat requests always expect responses"),
        Err(e) => {
            let missed = conn.record_heartbeat_miss();
            tracing::debug!(peer = %conn.remote_addr(), error = %e, missed, "heartbeat send failed");
        }
    }
}

async fn server_monitor(conn: Connection, interval: Duration) {
    let mut closed_rx = conn.closed_watch();
    loop {
        if *closed_rx.borrow() {
            return;
        }
        tokio::select! {
            _ = closed_rx.changed() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if !conn.is_active() {
            return;
        }
        if conn.read_idle_for() >= interval {
            tracing::info!(peer = %conn.remote_addr(), ?interval, "read-idle connection, closing");
            conn.close();
            return;
        }
    }
}

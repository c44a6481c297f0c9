//! Connection pooling and management.
//!
//! Each address (by unique key) maps to a pool of connections. Creation
//! races: the first successful build unblocks the caller while the rest
//! keep filling the pool in the background. Concurrent creates for one key
//! share a single build via the pool's gate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::{Connection, RemotingContext};
use crate::error::RemotingError;
use crate::reconnect::ReconnectManager;
use crate::url::Url;

/// How `get` picks among a pool's live connections.
#[derive(Debug, Clone, Copy, Default)]
pub enum ConnectionSelectStrategy {
    /// Uniform random over live connections.
    #[default]
    Random,
}

impl ConnectionSelectStrategy {
    pub fn select(&self, conns: &[Connection]) -> Option<Connection> {
        let live: Vec<&Connection> = conns.iter().filter(|c| c.is_active()).collect();
        if live.is_empty() {
            return None;
        }
        match self {
            Self::Random => {
                let idx = rand::thread_rng().gen_range(0..live.len());
                Some(live[idx].clone())
            }
        }
    }
}

/// Append-only list of connections sharing one unique key.
pub(crate) struct ConnectionPool {
    key: String,
    warmup: bool,
    conns: RwLock<Vec<Connection>>,
    /// Concurrent creates for this key share one build; followers wait here.
    build_gate: tokio::sync::Mutex<()>,
}

impl ConnectionPool {
    fn new(key: &str, warmup: bool) -> Self {
        Self {
            key: key.to_string(),
            warmup,
            conns: RwLock::new(Vec::new()),
            build_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn add(&self, conn: Connection) {
        conn.add_pool_key(&self.key);
        self.conns.write().push(conn);
    }

    pub(crate) fn remove_conn(&self, conn: &Connection) {
        self.conns.write().retain(|c| !c.ptr_eq(conn));
    }

    pub(crate) fn snapshot(&self) -> Vec<Connection> {
        self.conns.read().clone()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.conns.read().iter().filter(|c| c.is_active()).count()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }

    pub(crate) fn prune_closed(&self) {
        self.conns.write().retain(|c| c.is_active());
    }

    fn select(&self, strategy: ConnectionSelectStrategy) -> Option<Connection> {
        strategy.select(&self.conns.read())
    }

    /// Select only if the pool satisfies the warmed-up contract: at least
    /// one live connection, or the full target when warmup was requested.
    fn select_if_warm(&self, target: usize, strategy: ConnectionSelectStrategy) -> Option<Connection> {
        if self.warmup && self.live_count() < target {
            return None;
        }
        self.select(strategy)
    }
}

struct ManagerInner {
    ctx: Arc<RemotingContext>,
    strategy: ConnectionSelectStrategy,
    pools: Mutex<HashMap<String, Arc<ConnectionPool>>>,
    reconnector: Mutex<Option<ReconnectManager>>,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

/// Owner of every pooled connection. Connections acquired here belong to
/// the manager until their channel goes inactive; callers close them only
/// through [`ConnectionManager::remove`].
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub(crate) fn new(ctx: Arc<RemotingContext>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                ctx,
                strategy: ConnectionSelectStrategy::default(),
                pools: Mutex::new(HashMap::new()),
                reconnector: Mutex::new(None),
                scanner: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn context(&self) -> &Arc<RemotingContext> {
        &self.inner.ctx
    }

    pub(crate) fn attach_reconnector(&self, reconnector: ReconnectManager) {
        *self.inner.reconnector.lock() = Some(reconnector);
    }

    pub(crate) fn reconnector(&self) -> Option<ReconnectManager> {
        self.inner.reconnector.lock().clone()
    }

    fn pool_of(&self, url: &Url) -> Arc<ConnectionPool> {
        let key = url.unique_key();
        self.inner
            .pools
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ConnectionPool::new(&key, url.warmup)))
            .clone()
    }

    /// Fetch a connection for `url`, building the pool if needed.
    ///
    /// Builds up to `url.conn_num` connections in parallel. Without warmup
    /// the first success unblocks the caller and the remaining builds keep
    /// going in the background; with warmup all builds are awaited.
    pub async fn get_and_create_if_absent(&self, url: &Url) -> Result<Connection, RemotingError> {
        let pool = self.pool_of(url);
        if let Some(conn) = pool.select_if_warm(url.conn_num, self.inner.strategy) {
            return Ok(conn);
        }

        let _gate = pool.build_gate.lock().await;
        // A follower that waited on the gate finds the pool already built.
        if let Some(conn) = pool.select_if_warm(url.conn_num, self.inner.strategy) {
            return Ok(conn);
        }
        self.build_pool(url, &pool).await?;
        pool.select(self.inner.strategy)
            .ok_or_else(|| RemotingError::NoConnection(url.unique_key()))
    }

    async fn build_pool(
        &self,
        url: &Url,
        pool: &Arc<ConnectionPool>,
    ) -> Result<(), RemotingError> {
        let missing = url.conn_num.saturating_sub(pool.live_count());
        if missing == 0 {
            return Ok(());
        }
        let (tx, mut rx) = mpsc::channel::<Result<(), RemotingError>>(missing);
        for _ in 0..missing {
            let ctx = self.inner.ctx.clone();
            let url = url.clone();
            let pool = pool.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = match Connection::connect(&url, ctx).await {
                    Ok(conn) => {
                        pool.add(conn);
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                // The receiver may already have its first success and be gone.
                let _ = tx.send(outcome).await;
            });
        }
        drop(tx);

        if url.warmup {
            let mut succeeded = 0usize;
            let mut last_err = None;
            while let Some(outcome) = rx.recv().await {
                match outcome {
                    Ok(()) => succeeded += 1,
                    Err(e) => {
                        tracing::warn!(url = %url, error = %e, "warmup build failed");
                        last_err = Some(e);
                    }
                }
            }
            if succeeded == 0 {
                return Err(
                    last_err.unwrap_or_else(|| RemotingError::NoConnection(url.unique_key()))
                );
            }
            Ok(())
        } else {
            let mut failures = 0usize;
            while let Some(outcome) = rx.recv().await {
                match outcome {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        failures += 1;
                        if failures == missing {
                            return Err(e);
                        }
                    }
                }
            }
            Err(RemotingError::NoConnection(url.unique_key()))
        }
    }

    /// Select from an existing pool without creating anything.
    pub fn get(&self, key: &str) -> Option<Connection> {
        let pool = self.inner.pools.lock().get(key).cloned()?;
        pool.select(self.inner.strategy)
    }

    /// Append an externally created connection under `key`.
    pub fn add(&self, conn: Connection, key: &str) {
        let pools = &mut *self.inner.pools.lock();
        let pool = pools
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(ConnectionPool::new(key, false)));
        pool.add(conn);
    }

    /// Drop the pool for `key`, closing all its connections and disabling
    /// reconnect for the address.
    pub fn remove(&self, key: &str) {
        if let Some(reconnector) = self.reconnector() {
            reconnector.disable(key);
        }
        let pool = self.inner.pools.lock().remove(key);
        if let Some(pool) = pool {
            for conn in pool.snapshot() {
                conn.close();
            }
        }
    }

    /// Guard used by invoke entry points.
    pub fn check(&self, conn: &Connection) -> Result<(), RemotingError> {
        if conn.is_active() {
            Ok(())
        } else {
            Err(RemotingError::ConnectionClosed)
        }
    }

    /// Number of connections currently pooled under `key`.
    pub fn count(&self, key: &str) -> usize {
        self.inner
            .pools
            .lock()
            .get(key)
            .map(|p| p.live_count())
            .unwrap_or(0)
    }

    /// Close-event hook: unlink the connection from every alias it carries
    /// and hand the address to the reconnector.
    pub(crate) fn on_connection_closed(&self, conn: &Connection) {
        let keys = conn.pool_keys();
        {
            let pools = self.inner.pools.lock();
            for key in &keys {
                if let Some(pool) = pools.get(key) {
                    pool.remove_conn(conn);
                }
                conn.remove_pool_key(key);
            }
        }
        if let Some(reconnector) = self.reconnector() {
            reconnector.schedule(conn.url().clone());
        }
    }

    pub(crate) fn start_scanner(&self) {
        let manager = self.clone();
        let period = self.inner.ctx.config.scan_interval;
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tick.tick().await;
                manager.scan();
            }
        });
        *self.inner.scanner.lock() = Some(handle);
    }

    /// One maintenance sweep: close over-missed connections, reap leaked
    /// pendings, prune closed entries, drop empty non-warmup pools.
    pub(crate) fn scan(&self) {
        let now = Instant::now();
        let max_miss = self.inner.ctx.config.heartbeat_max_miss;
        let snapshot: Vec<(String, Arc<ConnectionPool>)> = self
            .inner
            .pools
            .lock()
            .iter()
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect();

        for (key, pool) in snapshot {
            for conn in pool.snapshot() {
                if conn.is_active() && conn.heartbeat_missed() >= max_miss {
                    tracing::warn!(%key, peer = %conn.remote_addr(), "closing over-missed connection");
                    conn.close();
                }
                conn.scan_invokes(now);
            }
            pool.prune_closed();
            if pool.is_empty() && !pool.warmup {
                let mut pools = self.inner.pools.lock();
                // Re-check under the lock; a build may have raced in.
                if pools.get(&key).is_some_and(|p| p.is_empty()) {
                    tracing::debug!(%key, "removing empty pool");
                    pools.remove(&key);
                }
            }
        }
    }

    /// Close everything and stop background work. The manager is unusable
    /// afterwards.
    pub(crate) fn shutdown(&self) {
        if let Some(handle) = self.inner.scanner.lock().take() {
            handle.abort();
        }
        if let Some(reconnector) = self.inner.reconnector.lock().take() {
            reconnector.shutdown();
        }
        let pools: Vec<Arc<ConnectionPool>> = self.inner.pools.lock().drain().map(|(_, p)| p).collect();
        for pool in pools {
            for conn in pool.snapshot() {
                conn.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_selects_nothing() {
        assert!(ConnectionSelectStrategy::Random.select(&[]).is_none());
    }
}

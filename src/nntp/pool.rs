//! Connection pool for NNTP providers using lock-free async channels.
//!
//! One pool per provider, bounded by the provider's (possibly clamped)
//! `max_conns`. Returned connections go back through a bounded channel;
//! when the channel is full the connection is simply dropped. A cleanup
//! worker closes connections that have idled past the threshold.

use std::sync::Arc;
use std::time::Instant;

use async_channel::{bounded, Receiver, Sender};
use tokio::sync::watch;
use tracing::debug;

use crate::config::{NntpSettings, ProviderConfig, POOL_CLEANUP_INTERVAL, POOL_IDLE_TIMEOUT};
use crate::error::Result;
use crate::nntp::conn::NntpConn;

struct IdleConn {
    conn: NntpConn,
    idle_since: Instant,
}

/// Connection pool for a single provider.
#[derive(Clone)]
pub struct NntpPool {
    provider: Arc<ProviderConfig>,
    settings: NntpSettings,
    /// Sender for returning connections to the pool
    pool_tx: Sender<IdleConn>,
    /// Receiver for getting connections from the pool
    pool_rx: Receiver<IdleConn>,
}

impl NntpPool {
    pub fn new(provider: ProviderConfig, settings: NntpSettings) -> Self {
        // Bounded to the provider's connection cap; the channel itself
        // provides the backpressure and the upper bound on pool growth.
        let capacity = provider.clamped_max_conns().max(1);
        let (pool_tx, pool_rx) = bounded(capacity);
        Self {
            provider: Arc::new(provider),
            settings,
            pool_tx,
            pool_rx,
        }
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    /// Connections this pool may hand out concurrently.
    pub fn max_conns(&self) -> usize {
        self.provider.clamped_max_conns().max(1)
    }

    /// Get a pooled connection or dial a new one.
    pub async fn get(&self) -> Result<PooledConn> {
        let conn = match self.pool_rx.try_recv() {
            Ok(idle) => idle.conn,
            Err(_) => NntpConn::connect(self.provider.clone(), &self.settings).await?,
        };

        Ok(PooledConn {
            conn: Some(conn),
            pool_tx: self.pool_tx.clone(),
        })
    }

    /// Spawn the idle-connection cleanup worker. Exits when `shutdown`
    /// flips to true.
    pub fn spawn_cleanup(&self, mut shutdown: watch::Receiver<bool>) {
        let pool_rx = self.pool_rx.clone();
        let pool_tx = self.pool_tx.clone();
        let provider = self.provider.name.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(POOL_CLEANUP_INTERVAL) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }

                // Drain the channel once; fresh connections go back,
                // stale ones get a polite QUIT.
                let mut kept = Vec::new();
                let mut closed = 0usize;
                while let Ok(idle) = pool_rx.try_recv() {
                    if idle.idle_since.elapsed() >= POOL_IDLE_TIMEOUT {
                        idle.conn.quit().await;
                        closed += 1;
                    } else {
                        kept.push(idle);
                    }
                }
                for idle in kept {
                    if pool_tx.try_send(idle).is_err() {
                        break;
                    }
                }
                if closed > 0 {
                    debug!(provider = %provider, closed, "closed idle NNTP connections");
                }
            }

            // Drop whatever is left so sockets close promptly.
            while let Ok(idle) = pool_rx.try_recv() {
                idle.conn.quit().await;
            }
        });
    }
}

/// RAII wrapper that returns the connection to the pool on drop.
pub struct PooledConn {
    conn: Option<NntpConn>,
    pool_tx: Sender<IdleConn>,
}

impl PooledConn {
    /// Take the connection out, preventing its return to the pool.
    /// Used when an operation left the protocol state unknown.
    pub fn discard(mut self) {
        self.conn = None;
    }
}

impl std::ops::Deref for PooledConn {
    type Target = NntpConn;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection taken")
    }
}

impl std::ops::DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Non-blocking: if the pool is already at capacity the
            // connection is dropped and the socket closes with it.
            let _ = self.pool_tx.try_send(IdleConn {
                conn,
                idle_since: Instant::now(),
            });
        }
    }
}

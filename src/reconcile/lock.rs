//! Per-epoch distributed lock.
//!
//! A set-if-absent key with a TTL arbitrates which worker owns an epoch's
//! sync. The TTL bounds how long a crashed owner can block the epoch; the
//! happy path releases explicitly.

use anyhow::Result;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tracing::{debug, info};

/// Redis-backed set-if-absent lock, one key per epoch.
pub struct EpochLock {
    conn: MultiplexedConnection,
    ttl_secs: u64,
}

impl EpochLock {
    pub async fn connect(url: &str, ttl_secs: u64) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(ttl_secs = ttl_secs, "connected to Redis (epoch lock)");
        Ok(Self { conn, ttl_secs })
    }

    fn key(epoch: u64) -> String {
        format!("processing:epoch:{epoch}")
    }

    /// True if this caller now owns the epoch.
    pub async fn try_acquire(&mut self, epoch: u64) -> Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::key(epoch))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut self.conn)
            .await?;
        let acquired = reply.is_some();
        if !acquired {
            debug!(epoch = epoch, "epoch lock busy");
        }
        Ok(acquired)
    }

    /// Release regardless of who holds it; called in the sync's finally
    /// path, where this process is known to be the owner.
    pub async fn release(&mut self, epoch: u64) -> Result<()> {
        let _: i64 = redis::cmd("DEL")
            .arg(Self::key(epoch))
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }
}

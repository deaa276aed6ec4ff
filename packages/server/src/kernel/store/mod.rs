//! The durable object store.
//!
//! One Postgres schema holds every persisted object. Saves come in
//! three kinds: `Insert` writes the whole record for a new object,
//! `Full` rewrites header and attributes, `Quick` touches only the
//! fixed header fields and is safe on hot paths. Quick failures retry
//! with bounded backoff; Insert/Full failures abort the request and
//! leave in-memory state unchanged.

mod job_store;
mod misc_store;
mod node_store;
mod resv_store;
pub mod statements;
mod tx;
mod upgrade;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::common::{BatchError, ErrorBand, Result};

pub use tx::StoreTx;
pub use upgrade::{upgrade_job_row, JOB_RECORD_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveKind {
    Insert,
    Full,
    Quick,
}

/// A hot update applied off the request path by the async commit
/// worker (resource-usage rows).
#[derive(Debug)]
pub struct HotUpdate {
    pub jobid: String,
    pub attributes: Vec<String>,
}

#[derive(Clone)]
pub struct ObjStore {
    pool: PgPool,
    async_tx: Option<mpsc::UnboundedSender<HotUpdate>>,
}

impl ObjStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool,
            async_tx: None,
        })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            async_tx: None,
        }
    }

    /// Pool that dials on first use. Lets the daemon and tests build a
    /// kernel before the datastore is reachable.
    pub fn connect_lazy(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_lazy(database_url)?;
        Ok(Self {
            pool,
            async_tx: None,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the schema migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn begin(&self) -> Result<StoreTx<'_>> {
        StoreTx::begin(&self.pool).await
    }

    /// Spawn the async commit worker and route hot updates to it.
    pub fn spawn_async_writer(&mut self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<HotUpdate>();
        self.async_tx = Some(tx);
        let store = ObjStore {
            pool: self.pool.clone(),
            async_tx: None,
        };
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if let Err(e) = store
                    .update_job_attrs_only(&update.jobid, &update.attributes)
                    .await
                {
                    warn!(jobid = %update.jobid, error = %e, "async attr commit failed");
                } else {
                    debug!(jobid = %update.jobid, "async attr commit");
                }
            }
        });
    }

    /// Queue a non-critical update for the async worker; falls back to
    /// an inline write when the worker is not running.
    pub async fn commit_async(&self, update: HotUpdate) -> Result<()> {
        match &self.async_tx {
            Some(tx) => {
                tx.send(update)
                    .map_err(|_| BatchError::Invariant("async writer gone".into()))?;
                Ok(())
            }
            None => {
                self.update_job_attrs_only(&update.jobid, &update.attributes)
                    .await
            }
        }
    }

    /// Retry policy for quick saves: transient store errors back off
    /// and try again a bounded number of times.
    pub(crate) async fn with_quick_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut delay = Duration::from_millis(50);
        let mut last = None;
        for _ in 0..3 {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.band() == ErrorBand::Transient => {
                    warn!(error = %e, "quick save retrying");
                    last = Some(e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or(BatchError::StoreBusy))
    }

    /// Datastore schema version (`select_dbver`).
    pub async fn schema_version(&self) -> Result<i32> {
        let ver: i32 = sqlx::query_scalar(statements::sql(statements::STMT_SELECT_DBVER))
            .fetch_one(&self.pool)
            .await?;
        Ok(ver)
    }
}

/// Forward-only cursor over loaded objects, delivered in the query's
/// defined order.
pub struct Cursor<T> {
    items: std::vec::IntoIter<T>,
}

impl<T> Cursor<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }

    pub fn next(&mut self) -> Option<T> {
        self.items.next()
    }
}

impl<T> Iterator for Cursor<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.items.next()
    }
}

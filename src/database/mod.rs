pub mod pool;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Postgres, Transaction};

use crate::proxy::LeaseAwareProxy;
use crate::resource::ResourceHandle;

pub use pool::{PgHandle, PgPoolBuilder};

/// What consumers can do with a credentialed Postgres pool.
///
/// Implemented by the concrete [`PgHandle`] and by [`LeaseAwareProxy`],
/// which forwards each call to the handle active when the call is made.
/// Code that needs the pool itself holds `proxy.current()` and uses
/// [`PgHandle::pool`], which keeps that handle from draining underneath it.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Check out a connection
    async fn acquire(&self) -> Result<PoolConnection<Postgres>, sqlx::Error>;

    /// Start a transaction on a fresh connection
    async fn begin(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error>;

    /// Open connections, idle or in use
    fn size(&self) -> u32;

    fn num_idle(&self) -> usize;
}

#[async_trait]
impl<H> DataSource for LeaseAwareProxy<H>
where
    H: DataSource + ResourceHandle,
{
    async fn acquire(&self) -> Result<PoolConnection<Postgres>, sqlx::Error> {
        self.current().acquire().await
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        self.current().begin().await
    }

    fn size(&self) -> u32 {
        self.current().size()
    }

    fn num_idle(&self) -> usize {
        self.current().num_idle()
    }
}

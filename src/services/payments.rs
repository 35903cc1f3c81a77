use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::sync::Arc;

use crate::database::DataSource;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: String,
    pub name: String,
    pub billing_address: Option<String>,
    pub created_at: NaiveDateTime,
}

/// Reads payments through whatever pool is current when each call is made.
/// Holding the service across a rotation is fine; it never caches a pool.
pub struct PaymentsService<D> {
    data_source: Arc<D>,
}

impl<D: DataSource> PaymentsService<D> {
    pub fn new(data_source: Arc<D>) -> Self {
        Self { data_source }
    }

    pub async fn list(&self) -> Result<Vec<Payment>, sqlx::Error> {
        let mut conn = self.data_source.acquire().await?;
        let payments = sqlx::query_as::<_, Payment>(
            "SELECT id::text AS id, name, billing_address, created_at FROM payments ORDER BY created_at",
        )
        .fetch_all(&mut *conn)
        .await?;
        Ok(payments)
    }

    /// Round-trip to the server without touching any table
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.data_source.acquire().await?;
        sqlx::query("SELECT 1").execute(&mut *conn).await?;
        Ok(())
    }
}

// PostgreSQL readiness check: connect and run SELECT 1

use crate::config::ProbeConfig;
use crate::errors::ProbeError;
use crate::models::ServiceKind;
use crate::probe::ReadinessCheck;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::instrument;

/// PostgresCheck connects with the configured credentials and requires
/// `SELECT 1` to return 1
pub struct PostgresCheck {
    probes: ProbeConfig,
    timeout: Duration,
}

impl PostgresCheck {
    pub fn from_config(probes: &ProbeConfig) -> Self {
        Self {
            probes: probes.clone(),
            timeout: Duration::from_secs(probes.request_timeout_seconds),
        }
    }

    pub fn connection_url(&self, target: &str) -> String {
        let (host, port) = ServiceKind::Postgres.address(target);
        self.probes.postgres_url(&host, port)
    }
}

#[async_trait]
impl ReadinessCheck for PostgresCheck {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Postgres
    }

    #[instrument(skip(self))]
    async fn try_check(&self, target: &str) -> Result<(), ProbeError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.timeout)
            .connect(&self.connection_url(target))
            .await
            .map_err(|e| ProbeError::Database(format!("Failed to connect to PostgreSQL: {}", e)))?;

        let result = sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await;
        pool.close().await;

        match result {
            Ok(1) => Ok(()),
            Ok(other) => Err(ProbeError::UnexpectedResponse(format!(
                "SELECT 1 returned {}",
                other
            ))),
            Err(e) => Err(ProbeError::Database(format!("Query failed: {}", e))),
        }
    }
}

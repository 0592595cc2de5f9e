//! Administrative access to the PostgreSQL-protocol target database.
//!
//! Covers only what the orchestrator itself needs: the durability kernel
//! parameter, replica identity, logical replication slots and publications.
//! Data movement is the engines' business.

use crate::config::DatabaseConfig;
use crate::error::PortalResult;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Replica identity applied to a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    Full,
    Default,
}

impl ReplicaIdentity {
    fn keyword(&self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::Default => "DEFAULT",
        }
    }
}

#[async_trait]
pub trait DatabaseAdmin: Send + Sync + fmt::Debug {
    /// Round-trip a trivial query
    async fn ping(&self) -> PortalResult<()>;

    /// Value of a server setting, e.g. `wal_level`
    async fn show_setting(&self, name: &str) -> PortalResult<String>;

    async fn set_fsync(&self, enabled: bool) -> PortalResult<()>;

    async fn list_tables(&self, schema: &str) -> PortalResult<Vec<String>>;

    async fn set_replica_identity(
        &self,
        schema: &str,
        table: &str,
        identity: ReplicaIdentity,
    ) -> PortalResult<()>;

    async fn list_replication_slots(&self) -> PortalResult<Vec<String>>;

    async fn create_replication_slot(&self, name: &str, plugin: &str) -> PortalResult<()>;

    async fn drop_replication_slot(&self, name: &str) -> PortalResult<()>;

    async fn list_publications(&self) -> PortalResult<Vec<String>>;

    /// Create a publication for all tables, or for `tables` when given
    async fn create_publication(&self, name: &str, tables: Option<&[String]>) -> PortalResult<()>;

    async fn drop_publication(&self, name: &str) -> PortalResult<()>;

    /// Whether the connecting role may publish all tables
    async fn is_superuser(&self) -> PortalResult<bool>;
}

/// [`DatabaseAdmin`] over a lazily connected `sqlx` pool
#[derive(Debug, Clone)]
pub struct PgDatabaseAdmin {
    pool: PgPool,
}

impl PgDatabaseAdmin {
    /// Build the pool without connecting; the first query opens a connection
    pub fn connect_lazy(config: &DatabaseConfig) -> PortalResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_lazy(&config.connection_url())?;
        debug!(host = %config.host, port = config.port, database = %config.database, "Database admin pool created");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Quote an identifier for interpolation into DDL
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[async_trait]
impl DatabaseAdmin for PgDatabaseAdmin {
    async fn ping(&self) -> PortalResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn show_setting(&self, name: &str) -> PortalResult<String> {
        let value: String = sqlx::query_scalar("SELECT current_setting($1)")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_fsync(&self, enabled: bool) -> PortalResult<()> {
        let value = if enabled { "on" } else { "off" };
        sqlx::query(&format!("ALTER SYSTEM SET fsync TO {value}"))
            .execute(&self.pool)
            .await?;
        sqlx::query("SELECT pg_reload_conf()").execute(&self.pool).await?;
        info!(fsync = value, "⚙️ Kernel parameter fsync adjusted");
        Ok(())
    }

    async fn list_tables(&self, schema: &str) -> PortalResult<Vec<String>> {
        let tables = sqlx::query_scalar::<_, String>(
            "SELECT tablename::text FROM pg_tables WHERE schemaname = $1 ORDER BY tablename",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(tables)
    }

    async fn set_replica_identity(
        &self,
        schema: &str,
        table: &str,
        identity: ReplicaIdentity,
    ) -> PortalResult<()> {
        let sql = format!(
            "ALTER TABLE {}.{} REPLICA IDENTITY {}",
            quote_ident(schema),
            quote_ident(table),
            identity.keyword()
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn list_replication_slots(&self) -> PortalResult<Vec<String>> {
        let slots = sqlx::query_scalar::<_, String>("SELECT slot_name::text FROM pg_replication_slots")
            .fetch_all(&self.pool)
            .await?;
        Ok(slots)
    }

    async fn create_replication_slot(&self, name: &str, plugin: &str) -> PortalResult<()> {
        sqlx::query("SELECT * FROM pg_create_logical_replication_slot($1, $2)")
            .bind(name)
            .bind(plugin)
            .execute(&self.pool)
            .await?;
        info!(slot = %name, plugin = %plugin, "🔌 Logical replication slot created");
        Ok(())
    }

    async fn drop_replication_slot(&self, name: &str) -> PortalResult<()> {
        sqlx::query("SELECT * FROM pg_drop_replication_slot($1)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        info!(slot = %name, "Logical replication slot dropped");
        Ok(())
    }

    async fn list_publications(&self) -> PortalResult<Vec<String>> {
        let publications = sqlx::query_scalar::<_, String>("SELECT pubname::text FROM pg_publication")
            .fetch_all(&self.pool)
            .await?;
        Ok(publications)
    }

    async fn create_publication(&self, name: &str, tables: Option<&[String]>) -> PortalResult<()> {
        let target = match tables {
            None => "ALL TABLES".to_string(),
            Some(tables) => format!(
                "TABLE {}",
                tables
                    .iter()
                    .map(|table| quote_ident(table))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };
        sqlx::query(&format!("CREATE PUBLICATION {} FOR {target}", quote_ident(name)))
            .execute(&self.pool)
            .await?;
        info!(publication = %name, "📣 Publication created");
        Ok(())
    }

    async fn drop_publication(&self, name: &str) -> PortalResult<()> {
        sqlx::query(&format!("DROP PUBLICATION {}", quote_ident(name)))
            .execute(&self.pool)
            .await?;
        info!(publication = %name, "Publication dropped");
        Ok(())
    }

    async fn is_superuser(&self) -> PortalResult<bool> {
        let superuser: Option<bool> =
            sqlx::query_scalar("SELECT rolsuper FROM pg_roles WHERE rolname = current_user")
                .fetch_optional(&self.pool)
                .await?;
        Ok(superuser.unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_replica_identity_keyword() {
        assert_eq!(ReplicaIdentity::Full.keyword(), "FULL");
        assert_eq!(ReplicaIdentity::Default.keyword(), "DEFAULT");
    }

    #[tokio::test]
    async fn test_connect_lazy_does_not_connect() {
        let config = DatabaseConfig {
            host: "127.0.0.1".into(),
            port: 1,
            database: "target".into(),
            username: "portal".into(),
            password: "secret".into(),
            ..DatabaseConfig::default()
        };
        assert!(PgDatabaseAdmin::connect_lazy(&config).is_ok());
    }
}

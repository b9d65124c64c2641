use std::time::Duration;

use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::MigratorTrait;

pub mod entities;
pub mod events;
pub mod models;
pub mod types;

pub use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbErr, TransactionTrait,
};

const DB_PATH_ENV: &str = "GREENROOM_DB_PATH";
const DEFAULT_DB_PATH: &str = "greenroom.sqlite";

#[derive(Clone)]
pub struct DBService {
    pub pool: DatabaseConnection,
}

fn database_url() -> String {
    let path = std::env::var(DB_PATH_ENV).unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
    format!("sqlite://{path}?mode=rwc")
}

impl DBService {
    /// Connect to the platform database and bring the schema up to date.
    pub async fn new() -> Result<DBService, DbErr> {
        Self::connect(&database_url()).await
    }

    pub async fn connect(url: &str) -> Result<DBService, DbErr> {
        let mut options = ConnectOptions::new(url.to_string());
        options
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .sqlx_logging(false);

        let pool = Database::connect(options).await?;
        if url.starts_with("sqlite:") {
            // WAL keeps the outbox sweeps from blocking command writes.
            pool.execute_unprepared("PRAGMA journal_mode = WAL;").await?;
            pool.execute_unprepared("PRAGMA busy_timeout = 30000;").await?;
        }
        db_migration::Migrator::up(&pool, None).await?;
        tracing::debug!("database schema is up to date");
        Ok(DBService { pool })
    }
}

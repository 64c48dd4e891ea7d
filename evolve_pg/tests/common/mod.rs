use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

/// Connects to `DATABASE_URL`. Returns `None` when it is unset so the suite can run without a
/// database.
pub async fn get_pg_pool() -> Option<PgPool> {
    let _ = env_logger::builder().is_test(true).try_init();
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL is not set, skipping postgres test");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&database_url)
        .await
        .expect("Failed to create Postgres pool");
    Some(pool)
}

pub async fn teardown(pool: &PgPool) {
    for table in [
        "evolve_events",
        "evolve_positions",
        "evolve_staged_events",
        "evolve_staged_positions",
        "evolve_models",
        "evolve_collection_fields",
        "evolve_migration_state",
        "_evolve_schema_migrations",
    ] {
        sqlx::query(&format!("DROP TABLE IF EXISTS {table} CASCADE"))
            .execute(pool)
            .await
            .unwrap_or_else(|e| panic!("Failed to drop {table}: {e}"));
    }
}

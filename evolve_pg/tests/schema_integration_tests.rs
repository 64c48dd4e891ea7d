mod common;

use evolve_pg::schema::SchemaMigrator;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn test_migrator_creates_tracking_table() {
    let Some(pool) = common::get_pg_pool().await else {
        return;
    };
    common::teardown(&pool).await;

    let migrator = SchemaMigrator::new(pool.clone());
    let version = migrator
        .current_version()
        .await
        .expect("Should get version");
    assert_eq!(version, 0, "Initial version should be 0");

    let result: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM information_schema.tables
        WHERE table_name = '_evolve_schema_migrations'
        "#,
    )
    .fetch_one(&pool)
    .await
    .expect("Failed to query information_schema");
    assert_eq!(result.0, 1, "_evolve_schema_migrations table should exist");

    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_migrator_runs_all_migrations_once() {
    let Some(pool) = common::get_pg_pool().await else {
        return;
    };
    common::teardown(&pool).await;

    let migrator = SchemaMigrator::new(pool.clone());
    let applied = migrator.run().await.expect("Should run migrations");
    assert_eq!(applied, 5);
    assert_eq!(migrator.current_version().await.unwrap(), 5);
    assert!(migrator.pending().await.unwrap().is_empty());

    let again = migrator.run().await.expect("Second run should succeed");
    assert_eq!(again, 0, "Nothing is pending on the second run");

    let records = migrator.applied().await.unwrap();
    let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "create_position_tables",
            "create_staging_tables",
            "create_derived_tables",
            "create_migration_state",
            "add_timestamp_text"
        ]
    );

    let (phase,): (String,) =
        sqlx::query_as("SELECT phase FROM evolve_migration_state WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(phase, "idle");

    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_migrator_detects_tampered_checksum() {
    let Some(pool) = common::get_pg_pool().await else {
        return;
    };
    common::teardown(&pool).await;

    let migrator = SchemaMigrator::new(pool.clone());
    migrator.run().await.unwrap();
    sqlx::query("UPDATE _evolve_schema_migrations SET checksum = 'tampered' WHERE version = 1")
        .execute(&pool)
        .await
        .unwrap();

    let err = migrator.run().await.unwrap_err();
    assert!(err.to_string().contains("checksum mismatch"));

    common::teardown(&pool).await;
}

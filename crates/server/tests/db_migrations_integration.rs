#[path = "../src/db/migrations.rs"]
mod migrations;
#[path = "../src/db/pool.rs"]
mod pool;

use pool::{create_pg_pool, PoolConfig};

const EXPECTED_TABLES: &[&str] =
    &["live_streams", "stream_participants", "live_chat_messages", "stream_cleanup_jobs"];

async fn migrated_pool() -> Option<sqlx::PgPool> {
    let Some(database_url) = std::env::var("SCROLLLIVE_TEST_DATABASE_URL").ok() else {
        eprintln!("skipping db migration integration test: set SCROLLLIVE_TEST_DATABASE_URL");
        return None;
    };

    let config = PoolConfig { min_connections: 1, max_connections: 2, ..PoolConfig::default() };
    let pool =
        create_pg_pool(&database_url, config).await.expect("pool should connect to test database");
    migrations::run_migrations(&pool).await.expect("migrations should apply");
    Some(pool)
}

#[tokio::test]
async fn migrations_create_expected_tables() {
    let Some(pool) = migrated_pool().await else {
        return;
    };

    let table_names: Vec<String> = sqlx::query_scalar::<_, String>(
        "SELECT table_name \
         FROM information_schema.tables \
         WHERE table_schema = 'public'",
    )
    .fetch_all(&pool)
    .await
    .expect("table lookup should succeed");

    for expected_table in EXPECTED_TABLES {
        assert!(
            table_names.iter().any(|name| name == expected_table),
            "expected table `{expected_table}` to exist after migrations"
        );
    }
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let Some(pool) = migrated_pool().await else {
        return;
    };

    migrations::run_migrations(&pool).await.expect("second run should be a no-op");
}

#[tokio::test]
async fn viewer_count_cannot_go_negative() {
    let Some(pool) = migrated_pool().await else {
        return;
    };

    let id = uuid::Uuid::new_v4();
    let result = sqlx::query(
        "INSERT INTO live_streams \
         (id, room_name, title, category, created_by, created_by_name, viewer_count) \
         VALUES ($1, $2, 'Test', 'Other', 'owner', 'Owner', -1)",
    )
    .bind(id)
    .bind(format!("stream-owner-{id}"))
    .execute(&pool)
    .await;

    assert!(result.is_err(), "negative viewer_count must violate the check constraint");
}

#[tokio::test]
async fn ended_streams_require_an_end_time() {
    let Some(pool) = migrated_pool().await else {
        return;
    };

    let id = uuid::Uuid::new_v4();
    let result = sqlx::query(
        "INSERT INTO live_streams \
         (id, room_name, title, category, created_by, created_by_name, is_live) \
         VALUES ($1, $2, 'Test', 'Other', 'owner', 'Owner', FALSE)",
    )
    .bind(id)
    .bind(format!("stream-owner-{id}"))
    .execute(&pool)
    .await;

    assert!(result.is_err(), "is_live = false without ended_at must be rejected");
}

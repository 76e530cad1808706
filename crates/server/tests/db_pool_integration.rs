#[path = "../src/db/pool.rs"]
mod pool;

use pool::{check_pool_health, create_pg_pool, PoolConfig};

fn test_database_url() -> Option<String> {
    let url = std::env::var("SCROLLLIVE_TEST_DATABASE_URL").ok();
    if url.is_none() {
        eprintln!("skipping db pool integration test: set SCROLLLIVE_TEST_DATABASE_URL to run it");
    }
    url
}

#[tokio::test]
async fn pool_connects_and_passes_health_check() {
    let Some(database_url) = test_database_url() else {
        return;
    };

    let config = PoolConfig { min_connections: 1, max_connections: 2, ..PoolConfig::default() };
    let pool =
        create_pg_pool(&database_url, config).await.expect("pool should connect to test database");

    check_pool_health(&pool).await.expect("health check query should succeed");
    assert_eq!(pool.options().get_max_connections(), 2);
}

#[tokio::test]
async fn closed_pool_fails_health_check() {
    let Some(database_url) = test_database_url() else {
        return;
    };

    let config = PoolConfig { min_connections: 0, max_connections: 1, ..PoolConfig::default() };
    let pool =
        create_pg_pool(&database_url, config).await.expect("pool should connect to test database");
    pool.close().await;

    let error = check_pool_health(&pool).await.expect_err("closed pool should fail");
    assert!(error.to_string().contains("health check failed"));
}

//! MySQL (engine family B) gateway tests with testcontainers.
//!
//! These tests start a MySQL container and are ignored by default;
//! run them with `cargo test -- --ignored` on a machine with Docker.

#![cfg(feature = "mysql")]

use std::time::Duration;

use dbgateway_core::{ConnectionConfig, EngineError, EngineFamily, Gateway, QueryOutcome};
use testcontainers_modules::{mysql::Mysql, testcontainers::runners::AsyncRunner};

fn config_for(port: u16) -> ConnectionConfig {
    ConnectionConfig::network(EngineFamily::Mysql, "127.0.0.1")
        .with_port(port)
        .with_database("test")
        .with_username("root")
}

/// Waits until the server accepts a trivial round trip.
async fn wait_until_ready(gateway: &Gateway, config: &ConnectionConfig) {
    for _ in 0..60 {
        if gateway.test_connection(config).await.success {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("MySQL never became ready");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_mysql_gateway_contract() {
    let container = Mysql::default().start().await.unwrap();
    let port = container.get_host_port_ipv4(3306).await.unwrap();
    let gateway = Gateway::new(Duration::from_secs(5), Some(Duration::from_secs(10)));
    let config = config_for(port);
    wait_until_ready(&gateway, &config).await;

    let outcome = gateway.execute_query(&config, "SELECT 1").await;
    assert!(outcome.is_success());
    assert_eq!(outcome.row_count(), 1);

    let setup = gateway
        .execute_query(
            &config,
            "CREATE TABLE products (
                 id INT AUTO_INCREMENT PRIMARY KEY,
                 sku VARCHAR(32) NOT NULL UNIQUE,
                 price DECIMAL(8, 2) DEFAULT 0.00,
                 category_id INT,
                 INDEX idx_category (category_id)
             )",
        )
        .await;
    assert!(setup.is_success(), "setup failed: {setup:?}");

    let inserted = gateway
        .execute_query(
            &config,
            "INSERT INTO products (sku, price, category_id) VALUES ('A-1', 4.50, 7), ('B-2', 12.00, NULL)",
        )
        .await;
    assert_eq!(inserted.row_count(), 2);

    let rows = gateway
        .execute_query(&config, "SELECT id, sku, price FROM products ORDER BY id")
        .await
        .into_result()
        .unwrap();
    assert_eq!(rows.columns, vec!["id", "sku", "price"]);
    assert_eq!(rows.data[0]["id"], 1);
    assert_eq!(rows.data[0]["sku"], "A-1");
    assert_eq!(rows.data[0]["price"], "4.50");

    let empty = gateway
        .execute_query(&config, "SELECT sku, price FROM products WHERE false")
        .await
        .into_result()
        .unwrap();
    assert_eq!(empty.columns, vec!["sku", "price"]);
    assert_eq!(empty.row_count, 0);

    let schema = gateway.introspect_schema(&config).await;
    assert!(schema.error.is_none(), "degraded: {:?}", schema.error);
    assert_eq!(schema.database_name.as_deref(), Some("test"));
    let columns = &schema.tables["products"].columns;
    let id = columns.iter().find(|c| c.name == "id").unwrap();
    assert!(id.primary_key);
    assert_eq!(id.constraint.as_deref(), Some("PRIMARY KEY"));
    let sku = columns.iter().find(|c| c.name == "sku").unwrap();
    assert_eq!(sku.key.as_deref(), Some("UNI"));
    let category = columns.iter().find(|c| c.name == "category_id").unwrap();
    assert_eq!(category.key.as_deref(), Some("MUL"));
    assert!(category.nullable);

    match gateway.execute_query(&config, "SELECT * FROM missing_table").await {
        QueryOutcome::Failure(EngineError::Execution(message)) => {
            assert!(message.contains("missing_table"));
        }
        other => panic!("expected execution failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_mysql_unreachable_port_fails_gracefully() {
    let config = ConnectionConfig::network(EngineFamily::Mysql, "127.0.0.1")
        .with_port(1)
        .with_database("test")
        .with_username("root");
    let gateway = Gateway::new(Duration::from_secs(2), None);

    let test = gateway.test_connection(&config).await;
    assert!(!test.success);
    assert!(test.error.is_some());
    assert!(gateway.table_statistics(&config).await.is_empty());
}

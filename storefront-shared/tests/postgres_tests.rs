/// Integration tests against a real PostgreSQL server
///
/// These tests require a running PostgreSQL database and are ignored by default.
/// Run with: cargo test --test postgres_tests -- --ignored --test-threads=1
///
/// Connection parameters come from the usual `DB_*` environment variables:
/// export DB_HOST=localhost DB_PORT=5432 DB_USER=storefront DB_PASSWORD=storefront DB_DATABASE=storefront_test

use storefront_shared::db::config::PoolConfig;
use storefront_shared::db::error::DbError;
use storefront_shared::db::executor::QueryRequest;
use storefront_shared::db::value::{Row, Value};
use storefront_shared::db::Database;
use storefront_shared::models::cart::{Cart, CartError};
use storefront_shared::models::product::{CreateProduct, Product};
use storefront_shared::models::user::{CreateUser, User};
use uuid::Uuid;

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        name TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS products (
        id UUID PRIMARY KEY,
        sku TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        description TEXT,
        price_cents BIGINT NOT NULL CHECK (price_cents >= 0),
        stock BIGINT NOT NULL CHECK (stock >= 0),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS cart_items (
        user_id UUID NOT NULL REFERENCES users (id),
        product_id UUID NOT NULL REFERENCES products (id),
        quantity BIGINT NOT NULL CHECK (quantity > 0),
        added_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (user_id, product_id)
    )",
];

/// Helper to connect and make sure the tables exist
async fn setup() -> Database {
    let config = PoolConfig::from_env().expect("DB_* variables must be set");
    let db = Database::postgres(config);
    db.init().await.expect("Failed to connect to PostgreSQL");

    for statement in SCHEMA {
        db.execute(QueryRequest::new(statement).with_label("schema"))
            .await
            .expect("Failed to create schema");
    }

    db
}

async fn create_user(db: &Database) -> User {
    User::create(
        db,
        CreateUser {
            email: format!("{}@example.com", Uuid::new_v4()),
            password_hash: "hash".to_string(),
            name: Some("Test User".to_string()),
        },
    )
    .await
    .expect("Failed to create user")
}

async fn create_product(db: &Database, stock: i64) -> Product {
    Product::create(
        db,
        CreateProduct {
            sku: format!("SKU-{}", Uuid::new_v4()),
            name: "Test Mug".to_string(),
            description: None,
            price_cents: 1_250,
            stock,
        },
    )
    .await
    .expect("Failed to create product")
}

#[tokio::test]
#[ignore]
async fn test_probe_and_types_round_trip() {
    let db = setup().await;

    let row: Row = db
        .fetch_one(
            QueryRequest::new("SELECT $1::int8 AS n, $2::text AS t, $3::bool AS b, NULL::text AS missing")
                .bind(42_i64)
                .bind("hello")
                .bind(true),
        )
        .await
        .unwrap();

    assert_eq!(row.get::<i64>("n").unwrap(), 42);
    assert_eq!(row.get::<String>("t").unwrap(), "hello");
    assert!(row.get::<bool>("b").unwrap());
    assert_eq!(row.value("missing"), Some(&Value::Null));

    db.shutdown().await;
}

#[tokio::test]
#[ignore]
async fn test_user_lifecycle() {
    let db = setup().await;
    let user = create_user(&db).await;

    let found = User::find_by_email(&db, &user.email.to_uppercase())
        .await
        .unwrap()
        .expect("user should be found case-insensitively");
    assert_eq!(found.id, user.id);

    let duplicate = User::create(
        &db,
        CreateUser {
            email: user.email.clone(),
            password_hash: "hash".to_string(),
            name: None,
        },
    )
    .await
    .unwrap_err();
    assert!(duplicate.is_unique_violation());
    assert_eq!(duplicate.constraint(), Some("users_email_key"));

    assert!(User::delete(&db, user.id).await.unwrap());
    assert!(User::find_by_id(&db, user.id).await.unwrap().is_none());

    db.shutdown().await;
}

#[tokio::test]
#[ignore]
async fn test_cart_reserves_stock() {
    let db = setup().await;
    let user = create_user(&db).await;
    let product = create_product(&db, 3).await;

    let line = Cart::add_item(&db, user.id, product.id, 2).await.unwrap();
    assert_eq!(line.quantity, 2);

    let err = Cart::add_item(&db, user.id, product.id, 2).await.unwrap_err();
    assert!(matches!(
        err,
        CartError::InsufficientStock {
            requested: 2,
            available: 1
        }
    ));

    let stock = Product::find_by_id(&db, product.id).await.unwrap().unwrap().stock;
    assert_eq!(stock, 1, "failed add must not change stock");

    assert_eq!(Cart::clear(&db, user.id).await.unwrap(), 1);
    let stock = Product::find_by_id(&db, product.id).await.unwrap().unwrap().stock;
    assert_eq!(stock, 3);

    User::delete(&db, user.id).await.unwrap();
    db.shutdown().await;
}

#[tokio::test]
#[ignore]
async fn test_rollback_on_constraint_violation() {
    let db = setup().await;
    let product = create_product(&db, 1).await;
    let id = product.id;

    let result: Result<(), DbError> = db
        .with_transaction(|tx| {
            Box::pin(async move {
                tx.update(
                    "UPDATE products SET name = $2 WHERE id = $1",
                    &[Value::Uuid(id), Value::from("Renamed")],
                    "products.rename",
                )
                .await?;
                // Violates the stock CHECK constraint
                tx.update(
                    "UPDATE products SET stock = stock - 5 WHERE id = $1",
                    &[Value::Uuid(id)],
                    "products.oversell",
                )
                .await?;
                Ok(())
            })
        })
        .await;

    let err = result.unwrap_err();
    assert!(matches!(&err, DbError::Query(e) if e.source.code() == Some("23514")));

    let product = Product::find_by_id(&db, id).await.unwrap().unwrap();
    assert_eq!(product.name, "Test Mug");
    assert_eq!(product.stock, 1);

    db.shutdown().await;
}

/// Product catalog model
///
/// Prices are stored as integer cents; stock is a non-negative count guarded
/// by a CHECK constraint so concurrent decrements can never oversell.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE products (
///     id UUID PRIMARY KEY,
///     sku TEXT NOT NULL UNIQUE,
///     name TEXT NOT NULL,
///     description TEXT,
///     price_cents BIGINT NOT NULL CHECK (price_cents >= 0),
///     stock BIGINT NOT NULL CHECK (stock >= 0),
///     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
/// );
/// ```

use crate::db::error::{DbResult, DecodeError};
use crate::db::executor::QueryRequest;
use crate::db::value::{FromRow, Row};
use crate::db::Database;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const COLUMNS: &str = "id, sku, name, description, price_cents, stock, created_at";

/// Maximum page size for [`Product::list`]
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,

    /// Stock keeping unit, unique
    pub sku: String,

    pub name: String,

    pub description: Option<String>,

    /// Unit price in cents
    pub price_cents: i64,

    /// Units available
    pub stock: i64,

    pub created_at: DateTime<Utc>,
}

impl FromRow for Product {
    fn from_row(row: &Row) -> Result<Self, DecodeError> {
        Ok(Product {
            id: row.get("id")?,
            sku: row.get("sku")?,
            name: row.get("name")?,
            description: row.get("description")?,
            price_cents: row.get("price_cents")?,
            stock: row.get("stock")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Input for creating a product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProduct {
    pub sku: String,
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub stock: i64,
}

impl Product {
    /// Creates a product
    ///
    /// # Errors
    ///
    /// - unique violation if the SKU exists
    /// - check violation for a negative price or stock
    pub async fn create(db: &Database, data: CreateProduct) -> DbResult<Self> {
        let request = QueryRequest::new(format!(
            "INSERT INTO products (id, sku, name, description, price_cents, stock) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
            COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(data.sku)
        .bind(data.name)
        .bind(data.description)
        .bind(data.price_cents)
        .bind(data.stock)
        .with_label("products.create");

        db.fetch_one(request).await
    }

    pub async fn find_by_id(db: &Database, id: Uuid) -> DbResult<Option<Self>> {
        let request = QueryRequest::new(format!("SELECT {} FROM products WHERE id = $1", COLUMNS))
            .bind(id)
            .with_label("products.find_by_id");

        db.fetch_optional(request).await
    }

    /// Lists products ordered by name
    ///
    /// `limit` is clamped to 1..=[`MAX_PAGE_SIZE`].
    pub async fn list(db: &Database, limit: i64, offset: i64) -> DbResult<Vec<Self>> {
        let request = QueryRequest::new(format!(
            "SELECT {} FROM products ORDER BY name, id LIMIT $1 OFFSET $2",
            COLUMNS
        ))
        .bind(limit.clamp(1, MAX_PAGE_SIZE))
        .bind(offset.max(0))
        .with_label("products.list");

        db.fetch_all(request).await
    }

    /// Adds `delta` (possibly negative) to the stock count
    ///
    /// # Returns
    ///
    /// The new stock count, or None if the product does not exist
    ///
    /// # Errors
    ///
    /// Check violation if the stock would drop below zero
    pub async fn adjust_stock(db: &Database, id: Uuid, delta: i64) -> DbResult<Option<i64>> {
        let request = QueryRequest::new(
            "UPDATE products SET stock = stock + $2 WHERE id = $1 RETURNING stock",
        )
        .bind(id)
        .bind(delta)
        .with_label("products.adjust_stock");

        let row: Option<Row> = db.fetch_optional(request).await?;
        Ok(row.map(|r| r.get("stock")).transpose()?)
    }
}

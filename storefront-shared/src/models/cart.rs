/// Shopping cart model
///
/// Cart lines reserve stock: adding an item decrements the product's stock and
/// removing it puts the stock back. Both happen in one transaction with the
/// cart change, so a failure halfway leaves neither applied.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE cart_items (
///     user_id UUID NOT NULL REFERENCES users (id),
///     product_id UUID NOT NULL REFERENCES products (id),
///     quantity BIGINT NOT NULL CHECK (quantity > 0),
///     added_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
///     PRIMARY KEY (user_id, product_id)
/// );
/// ```
///
/// # Example
///
/// ```no_run
/// use storefront_shared::db::database::Database;
/// use storefront_shared::models::cart::{Cart, CartError};
/// use uuid::Uuid;
///
/// # async fn example(db: Database, user_id: Uuid, product_id: Uuid) -> Result<(), CartError> {
/// match Cart::add_item(&db, user_id, product_id, 2).await {
///     Ok(line) => println!("{} in cart", line.quantity),
///     Err(CartError::InsufficientStock { available, .. }) => {
///         println!("only {} left", available)
///     }
///     Err(other) => return Err(other),
/// }
/// # Ok(())
/// # }
/// ```

use crate::db::error::{DbError, DecodeError};
use crate::db::executor::QueryRequest;
use crate::db::value::{FromRow, Row, Value};
use crate::db::Database;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const COLUMNS: &str = "user_id, product_id, quantity, added_at";

/// One product line in a user's cart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i64,
    pub added_at: DateTime<Utc>,
}

impl FromRow for CartItem {
    fn from_row(row: &Row) -> Result<Self, DecodeError> {
        Ok(CartItem {
            user_id: row.get("user_id")?,
            product_id: row.get("product_id")?,
            quantity: row.get("quantity")?,
            added_at: row.get("added_at")?,
        })
    }
}

/// Cart operation failures
#[derive(Debug, Error)]
pub enum CartError {
    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(i64),

    #[error("product {0} not found")]
    ProductNotFound(Uuid),

    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: i64, available: i64 },

    #[error(transparent)]
    Database(#[from] DbError),
}

/// Cart operations, keyed by user
pub struct Cart;

impl Cart {
    /// Adds `quantity` units of a product to the user's cart
    ///
    /// Locks the product row, checks and decrements stock, then inserts the
    /// line or increases its quantity.
    ///
    /// # Returns
    ///
    /// The cart line after the change
    ///
    /// # Errors
    ///
    /// - `InvalidQuantity` for a zero or negative quantity
    /// - `ProductNotFound` / `InsufficientStock` (nothing is changed)
    /// - `Database` for anything the store rejects
    pub async fn add_item(
        db: &Database,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i64,
    ) -> Result<CartItem, CartError> {
        if quantity <= 0 {
            return Err(CartError::InvalidQuantity(quantity));
        }

        db.with_transaction(|tx| {
            Box::pin(async move {
                let product: Option<Row> = tx
                    .fetch_optional(
                        QueryRequest::new("SELECT stock FROM products WHERE id = $1 FOR UPDATE")
                            .bind(product_id)
                            .with_label("cart.lock_product"),
                    )
                    .await?;

                let available: i64 = match product {
                    Some(row) => row.get("stock").map_err(DbError::from)?,
                    None => return Err(CartError::ProductNotFound(product_id)),
                };

                if available < quantity {
                    return Err(CartError::InsufficientStock {
                        requested: quantity,
                        available,
                    });
                }

                tx.update(
                    "UPDATE products SET stock = stock - $2 WHERE id = $1",
                    &[Value::Uuid(product_id), Value::Int(quantity)],
                    "cart.reserve_stock",
                )
                .await?;

                let line = tx
                    .fetch_one(
                        QueryRequest::new(format!(
                            "INSERT INTO cart_items (user_id, product_id, quantity) VALUES ($1, $2, $3) \
                             ON CONFLICT (user_id, product_id) \
                             DO UPDATE SET quantity = cart_items.quantity + EXCLUDED.quantity \
                             RETURNING {}",
                            COLUMNS
                        ))
                        .bind(user_id)
                        .bind(product_id)
                        .bind(quantity)
                        .with_label("cart.upsert_item"),
                    )
                    .await?;

                Ok(line)
            })
        })
        .await
    }

    /// Lists the user's cart, oldest line first
    pub async fn list_items(db: &Database, user_id: Uuid) -> Result<Vec<CartItem>, CartError> {
        let request = QueryRequest::new(format!(
            "SELECT {} FROM cart_items WHERE user_id = $1 ORDER BY added_at, product_id",
            COLUMNS
        ))
        .bind(user_id)
        .with_label("cart.list_items");

        Ok(db.fetch_all(request).await?)
    }

    /// Removes a line and returns its stock to the product
    ///
    /// # Returns
    ///
    /// True if the line existed
    pub async fn remove_item(db: &Database, user_id: Uuid, product_id: Uuid) -> Result<bool, CartError> {
        db.with_transaction(|tx| {
            Box::pin(async move {
                let removed: Option<Row> = tx
                    .fetch_optional(
                        QueryRequest::new(
                            "DELETE FROM cart_items WHERE user_id = $1 AND product_id = $2 RETURNING quantity",
                        )
                        .bind(user_id)
                        .bind(product_id)
                        .with_label("cart.remove_item"),
                    )
                    .await?;

                let Some(row) = removed else {
                    return Ok(false);
                };
                let quantity: i64 = row.get("quantity").map_err(DbError::from)?;

                tx.update(
                    "UPDATE products SET stock = stock + $2 WHERE id = $1",
                    &[Value::Uuid(product_id), Value::Int(quantity)],
                    "cart.release_stock",
                )
                .await?;

                Ok(true)
            })
        })
        .await
    }

    /// Empties the user's cart, returning all reserved stock
    ///
    /// # Returns
    ///
    /// Number of lines removed
    pub async fn clear(db: &Database, user_id: Uuid) -> Result<u64, CartError> {
        db.with_transaction(|tx| {
            Box::pin(async move {
                let lines: Vec<CartItem> = tx
                    .fetch_all(
                        QueryRequest::new(format!(
                            "DELETE FROM cart_items WHERE user_id = $1 RETURNING {}",
                            COLUMNS
                        ))
                        .bind(user_id)
                        .with_label("cart.clear"),
                    )
                    .await?;

                for line in &lines {
                    tx.update(
                        "UPDATE products SET stock = stock + $2 WHERE id = $1",
                        &[Value::Uuid(line.product_id), Value::Int(line.quantity)],
                        "cart.release_stock",
                    )
                    .await?;
                }

                Ok(lines.len() as u64)
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::backend::mock::MockFactory;
    use crate::db::config::PoolConfig;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_non_positive_quantity_rejected_without_query() {
        let factory = MockFactory::new();
        let config = PoolConfig::new("localhost", 5432, "shop", "secret", "shop");
        let db = Database::new(config, Arc::new(factory.clone()));
        db.init().await.unwrap();
        let statements = factory.statements();

        let err = Cart::add_item(&db, Uuid::new_v4(), Uuid::new_v4(), 0)
            .await
            .unwrap_err();

        assert!(matches!(err, CartError::InvalidQuantity(0)));
        assert_eq!(factory.statements(), statements);
    }

    #[tokio::test]
    async fn test_database_errors_roll_back() {
        // The in-memory backend rejects row locking, so the first statement fails
        let factory = MockFactory::new();
        let config = PoolConfig::new("localhost", 5432, "shop", "secret", "shop");
        let db = Database::new(config, Arc::new(factory.clone()));
        db.init().await.unwrap();

        let err = Cart::add_item(&db, Uuid::new_v4(), Uuid::new_v4(), 1)
            .await
            .unwrap_err();

        let CartError::Database(DbError::Query(query)) = err else {
            panic!("expected a query error");
        };
        assert_eq!(query.label.as_deref(), Some("cart.lock_product"));
        assert_eq!(db.stats().unwrap().leased, 0);
    }

    #[test]
    fn test_cart_item_from_row() {
        let user_id = Uuid::new_v4();
        let row: Row = [
            ("user_id", Value::Uuid(user_id)),
            ("product_id", Value::Uuid(Uuid::new_v4())),
            ("quantity", Value::Int(2)),
            ("added_at", Value::Timestamp(Utc::now())),
        ]
        .into_iter()
        .collect();

        let item = CartItem::from_row(&row).unwrap();
        assert_eq!(item.user_id, user_id);
        assert_eq!(item.quantity, 2);
    }

    #[test]
    fn test_error_messages() {
        let err = CartError::InsufficientStock {
            requested: 3,
            available: 1,
        };
        assert_eq!(err.to_string(), "insufficient stock: requested 3, available 1");
    }
}

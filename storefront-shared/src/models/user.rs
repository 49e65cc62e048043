/// User model and database operations
///
/// This module provides the User model and CRUD operations for customer
/// accounts. Carts reference users by id.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE users (
///     id UUID PRIMARY KEY,
///     email TEXT NOT NULL UNIQUE,
///     password_hash TEXT NOT NULL,
///     name TEXT,
///     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
/// );
/// ```
///
/// # Example
///
/// ```no_run
/// use storefront_shared::db::config::PoolConfig;
/// use storefront_shared::db::database::Database;
/// use storefront_shared::models::user::{CreateUser, User};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let db = Database::postgres(PoolConfig::from_env()?);
/// db.init().await?;
///
/// // Create a new user
/// let new_user = CreateUser {
///     email: "user@example.com".to_string(),
///     password_hash: "$argon2id$...".to_string(),
///     name: Some("Jane Doe".to_string()),
/// };
///
/// let user = User::create(&db, new_user).await?;
/// println!("Created user: {}", user.id);
///
/// // Find by email
/// let found = User::find_by_email(&db, "user@example.com").await?;
/// # Ok(())
/// # }
/// ```

use crate::db::error::{DbResult, DecodeError};
use crate::db::executor::QueryRequest;
use crate::db::value::{FromRow, Row, Value};
use crate::db::Database;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const COLUMNS: &str = "id, email, password_hash, name, created_at";

/// User model representing a customer account
///
/// Passwords are stored as hashes, never in plaintext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Unique user ID (UUID v4)
    pub id: Uuid,

    /// Email address
    ///
    /// Must be unique across all users
    pub email: String,

    /// Password hash (never serialized)
    #[serde(skip_serializing)]
    pub password_hash: String,

    /// Optional display name
    pub name: Option<String>,

    /// When the account was created
    pub created_at: DateTime<Utc>,
}

impl FromRow for User {
    fn from_row(row: &Row) -> Result<Self, DecodeError> {
        Ok(User {
            id: row.get("id")?,
            email: row.get("email")?,
            password_hash: row.get("password_hash")?,
            name: row.get("name")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Input for creating a new user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUser {
    /// Email address
    pub email: String,

    /// Password hash (NOT plaintext password!)
    pub password_hash: String,

    /// Optional display name
    pub name: Option<String>,
}

impl User {
    /// Creates a new user in the database
    ///
    /// # Returns
    ///
    /// The newly created user with generated ID and timestamp
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Email already exists (`DbError::is_unique_violation`)
    /// - No connection is available within the connect timeout
    pub async fn create(db: &Database, data: CreateUser) -> DbResult<Self> {
        let request = QueryRequest::new(format!(
            "INSERT INTO users (id, email, password_hash, name) VALUES ($1, $2, $3, $4) RETURNING {}",
            COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(data.email)
        .bind(data.password_hash)
        .bind(data.name)
        .with_label("users.create");

        db.fetch_one(request).await
    }

    /// Finds a user by ID
    ///
    /// # Returns
    ///
    /// The user if found, None otherwise
    pub async fn find_by_id(db: &Database, id: Uuid) -> DbResult<Option<Self>> {
        let request = QueryRequest::new(format!("SELECT {} FROM users WHERE id = $1", COLUMNS))
            .bind(id)
            .with_label("users.find_by_id");

        db.fetch_optional(request).await
    }

    /// Finds a user by email address (case-insensitive)
    pub async fn find_by_email(db: &Database, email: &str) -> DbResult<Option<Self>> {
        let request = QueryRequest::new(format!(
            "SELECT {} FROM users WHERE lower(email) = lower($1)",
            COLUMNS
        ))
        .bind(email)
        .with_label("users.find_by_email");

        db.fetch_optional(request).await
    }

    /// Deletes a user and their cart
    ///
    /// Both deletes run in one transaction.
    ///
    /// # Returns
    ///
    /// True if the user existed
    pub async fn delete(db: &Database, id: Uuid) -> DbResult<bool> {
        db.with_transaction(|tx| {
            Box::pin(async move {
                tx.delete(
                    "DELETE FROM cart_items WHERE user_id = $1",
                    &[Value::Uuid(id)],
                    "cart_items.delete_for_user",
                )
                .await?;

                let deleted = tx
                    .delete(
                        "DELETE FROM users WHERE id = $1",
                        &[Value::Uuid(id)],
                        "users.delete",
                    )
                    .await?;

                Ok(deleted.rows_affected() > 0)
            })
        })
        .await
    }
}

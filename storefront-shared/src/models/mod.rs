/// Database models for Storefront
///
/// Repositories for the catalog, customer accounts and carts. Each model maps
/// rows through [`crate::db::value::FromRow`] and runs its statements through a
/// [`crate::db::Database`] handle; multi-statement changes use
/// [`crate::db::Database::with_transaction`].
///
/// # Models
///
/// - `user`: customer accounts
/// - `product`: catalog entries with stock counts
/// - `cart`: cart lines that reserve stock
///
/// # Example
///
/// ```no_run
/// use storefront_shared::db::config::PoolConfig;
/// use storefront_shared::db::Database;
/// use storefront_shared::models::product::Product;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let db = Database::postgres(PoolConfig::from_env()?);
/// db.init().await?;
///
/// for product in Product::list(&db, 20, 0).await? {
///     println!("{} ({} in stock)", product.name, product.stock);
/// }
/// # Ok(())
/// # }
/// ```

pub mod cart;
pub mod product;
pub mod user;

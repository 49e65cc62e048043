/// API route handlers
///
/// - `health`: Health check endpoint
/// - `products`: Product catalog
/// - `carts`: Per-user carts

pub mod carts;
pub mod health;
pub mod products;

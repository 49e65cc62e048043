/// Application state and router builder
///
/// This module defines the shared application state and provides
/// a function to build the Axum router with all routes and middleware.
///
/// # Example
///
/// ```no_run
/// use storefront_api::{app::AppState, config::Config};
/// use storefront_shared::db::Database;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = Config::from_env()?;
/// let db = Database::postgres(config.database);
/// db.init().await?;
/// let state = AppState::new(db);
/// let app = storefront_api::app::build_router(state);
/// # Ok(())
/// # }
/// ```

use axum::{
    routing::{delete, get},
    Router,
};
use storefront_shared::db::Database;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Shared application state
///
/// This is cloned for each request handler via Axum's `State` extractor.
/// `Database` is a shared handle, so cloning never opens connections.
#[derive(Clone)]
pub struct AppState {
    /// Database handle
    pub db: Database,
}

impl AppState {
    /// Creates new application state
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

/// Builds the Axum router with all routes and middleware
///
/// ```text
/// /
/// ├── /health                              # Health check and pool statistics
/// └── /v1/
///     ├── /products                        # GET: paged list
///     ├── /products/:id                    # GET
///     ├── /users/:user_id/cart             # GET, POST (add line), DELETE (clear)
///     └── /users/:user_id/cart/:product_id # DELETE
/// ```
pub fn build_router(state: AppState) -> Router {
    use crate::routes;

    let v1_routes = Router::new()
        .route("/products", get(routes::products::list_products))
        .route("/products/:id", get(routes::products::get_product))
        .route(
            "/users/:user_id/cart",
            get(routes::carts::list_cart)
                .post(routes::carts::add_item)
                .delete(routes::carts::clear_cart),
        )
        .route(
            "/users/:user_id/cart/:product_id",
            delete(routes::carts::remove_item),
        );

    Router::new()
        .route("/health", get(routes::health::health_check))
        .nest("/v1", v1_routes)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

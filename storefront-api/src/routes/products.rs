/// Product catalog endpoints
///
/// ```text
/// GET /v1/products?limit=20&offset=0
/// GET /v1/products/:id
/// ```

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use storefront_shared::models::product::{Product, MAX_PAGE_SIZE};
use uuid::Uuid;

/// Default page size when `limit` is omitted
const DEFAULT_PAGE_SIZE: i64 = 20;

/// Paging parameters
#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    /// Page size, capped at 100
    pub limit: Option<i64>,

    /// Rows to skip
    pub offset: Option<i64>,
}

/// One page of products
#[derive(Debug, Serialize)]
pub struct ProductPage {
    pub products: Vec<Product>,
    pub limit: i64,
    pub offset: i64,
}

/// Lists products ordered by name
pub async fn list_products(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<ProductPage>> {
    let limit = page.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    if !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_PAGE_SIZE
        )));
    }
    let offset = page.offset.unwrap_or(0);
    if offset < 0 {
        return Err(ApiError::BadRequest("offset must not be negative".to_string()));
    }

    let products = Product::list(&state.db, limit, offset).await?;

    Ok(Json(ProductPage {
        products,
        limit,
        offset,
    }))
}

/// Fetches one product
pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Product>> {
    Product::find_by_id(&state.db, id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Product {} not found", id)))
}

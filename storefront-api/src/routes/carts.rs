/// Cart endpoints
///
/// Adding a line reserves stock and removing one returns it; both run in a
/// single transaction on the database side.
///
/// ```text
/// GET    /v1/users/:user_id/cart
/// POST   /v1/users/:user_id/cart              {"product_id": "...", "quantity": 2}
/// DELETE /v1/users/:user_id/cart
/// DELETE /v1/users/:user_id/cart/:product_id
/// ```

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use storefront_shared::models::cart::{Cart, CartItem};
use uuid::Uuid;

/// Request body for adding to a cart
#[derive(Debug, Deserialize)]
pub struct AddItemRequest {
    pub product_id: Uuid,
    pub quantity: i64,
}

/// Cart contents
#[derive(Debug, Serialize)]
pub struct CartResponse {
    pub items: Vec<CartItem>,
}

/// Result of emptying a cart
#[derive(Debug, Serialize)]
pub struct ClearCartResponse {
    pub removed: u64,
}

pub async fn list_cart(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<CartResponse>> {
    let items = Cart::list_items(&state.db, user_id).await?;
    Ok(Json(CartResponse { items }))
}

/// Adds a product to the cart, merging with an existing line
///
/// Responds `201 Created` with the resulting line. Out-of-stock requests
/// get `409 Conflict` and leave stock untouched.
pub async fn add_item(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(body): Json<AddItemRequest>,
) -> ApiResult<(StatusCode, Json<CartItem>)> {
    let line = Cart::add_item(&state.db, user_id, body.product_id, body.quantity).await?;

    tracing::info!(
        user_id = %user_id,
        product_id = %body.product_id,
        quantity = line.quantity,
        "Cart line updated"
    );

    Ok((StatusCode::CREATED, Json(line)))
}

pub async fn remove_item(
    State(state): State<AppState>,
    Path((user_id, product_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    if Cart::remove_item(&state.db, user_id, product_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!(
            "Product {} is not in the cart",
            product_id
        )))
    }
}

pub async fn clear_cart(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<ClearCartResponse>> {
    let removed = Cart::clear(&state.db, user_id).await?;
    Ok(Json(ClearCartResponse { removed }))
}

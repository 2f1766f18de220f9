use axum::{
    extract::{Path, Query, State},
    response::Response,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::common::{created_response, success_response};
use crate::errors::ServiceError;
use crate::models::{Cart, CartEntry, CartKind, TimeSlot};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct CartParams {
    /// Read the remote cart first; remote wins on conflict.
    #[serde(default)]
    pub reconcile: bool,
}

#[derive(Debug, Deserialize)]
pub struct ClearParams {
    pub kind: CartKind,
}

#[derive(Debug, Deserialize)]
pub struct SlotSelection {
    pub slot: Option<TimeSlot>,
}

#[derive(Debug, Deserialize)]
pub struct QuantityChange {
    pub quantity: u32,
}

#[derive(Debug, Serialize)]
pub struct ClearResult {
    pub kind: CartKind,
    pub removed: usize,
}

fn ensure_owner(user_id: Uuid, entry: &CartEntry) -> Result<(), ServiceError> {
    if entry.user_id() != user_id {
        return Err(ServiceError::ValidationError(
            "entry belongs to another user".to_string(),
        ));
    }
    Ok(())
}

async fn get_cart(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(params): Query<CartParams>,
) -> Result<Response, ServiceError> {
    let cart: Cart = if params.reconcile {
        state.carts.reconcile(user_id).await?
    } else {
        state.carts.snapshot(user_id).await?
    };
    Ok(success_response(cart))
}

async fn add_entry(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(entry): Json<CartEntry>,
) -> Result<Response, ServiceError> {
    ensure_owner(user_id, &entry)?;
    if let Some(slot) = entry.slot() {
        state.slots.ensure_bookable(slot)?;
    }
    Ok(created_response(state.carts.add(entry).await?))
}

async fn remove_entry(
    State(state): State<AppState>,
    Path((user_id, entry_id)): Path<(Uuid, Uuid)>,
) -> Result<Response, ServiceError> {
    Ok(success_response(state.carts.remove(user_id, entry_id).await?))
}

/// Selecting an expired slot is refused here, not only hidden in the UI.
async fn set_slot(
    State(state): State<AppState>,
    Path((user_id, entry_id)): Path<(Uuid, Uuid)>,
    Json(selection): Json<SlotSelection>,
) -> Result<Response, ServiceError> {
    if let Some(slot) = &selection.slot {
        state.slots.ensure_bookable(slot)?;
    }
    let cart = state
        .carts
        .set_slot(user_id, entry_id, selection.slot)
        .await?;
    Ok(success_response(cart))
}

async fn set_quantity(
    State(state): State<AppState>,
    Path((user_id, entry_id)): Path<(Uuid, Uuid)>,
    Json(change): Json<QuantityChange>,
) -> Result<Response, ServiceError> {
    let cart = state
        .carts
        .set_quantity(user_id, entry_id, change.quantity)
        .await?;
    Ok(success_response(cart))
}

async fn clear_kind(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(params): Query<ClearParams>,
) -> Result<Response, ServiceError> {
    let removed = state.carts.clear(user_id, params.kind).await?;
    Ok(success_response(ClearResult {
        kind: params.kind,
        removed,
    }))
}

/// Swaps the whole partition, as when the user picks another center.
async fn replace_kind(
    State(state): State<AppState>,
    Path((user_id, kind)): Path<(Uuid, CartKind)>,
    Json(entries): Json<Vec<CartEntry>>,
) -> Result<Response, ServiceError> {
    Ok(success_response(
        state.carts.replace(user_id, kind, entries).await?,
    ))
}

pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/carts/:user_id", get(get_cart).delete(clear_kind))
        .route("/carts/:user_id/entries", post(add_entry))
        .route("/carts/:user_id/entries/:entry_id", delete(remove_entry))
        .route("/carts/:user_id/entries/:entry_id/slot", put(set_slot))
        .route("/carts/:user_id/entries/:entry_id/quantity", put(set_quantity))
        .route("/carts/:user_id/partitions/:kind", put(replace_kind))
}

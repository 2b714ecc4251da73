//! Shared cart lines, cart operations and the reconciler that merges them.
//!
//! A room's cart holds at most one line per `external_product_id`. Every
//! operation produces the full new line list; callers persist that list and
//! project it with [`CartView::project`] for broadcast. The projection is built
//! fresh on every read and never stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Catalog data captured when a product is first added. Not refreshed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSnapshot {
    pub name: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ProductSnapshot {
    /// Stand-in used when an add carries no catalog data.
    pub fn placeholder(product_id: &str) -> Self {
        Self {
            name: format!("Product {}", product_id),
            price: 0.0,
            images: Vec::new(),
            description: None,
        }
    }

    fn validate(&self) -> AppResult<()> {
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(AppError::Validation(format!(
                "invalid price {} for product '{}'",
                self.price, self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub external_product_id: String,
    pub quantity: i64,
    pub unit_price_snapshot: f64,
    pub product_snapshot: ProductSnapshot,
    pub added_by: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CartAction {
    Add,
    Remove,
    Update,
}

/// A validated cart mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum CartOperation {
    Add {
        product_id: String,
        quantity: Option<i64>,
        snapshot: ProductSnapshot,
    },
    Remove {
        product_id: String,
    },
    Update {
        product_id: String,
        quantity: i64,
    },
}

impl CartOperation {
    /// Build an operation from the loosely-typed wire payload.
    pub fn from_request(
        action: CartAction,
        product_id: Option<String>,
        quantity: Option<i64>,
        product_data: Option<ProductSnapshot>,
    ) -> AppResult<Self> {
        let product_id = product_id
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| AppError::Validation("productId is required".to_string()))?;

        match action {
            CartAction::Add => {
                let snapshot =
                    product_data.unwrap_or_else(|| ProductSnapshot::placeholder(&product_id));
                snapshot.validate()?;
                Ok(CartOperation::Add {
                    product_id,
                    quantity,
                    snapshot,
                })
            }
            CartAction::Remove => Ok(CartOperation::Remove { product_id }),
            CartAction::Update => {
                let quantity = quantity.ok_or_else(|| {
                    AppError::Validation("quantity is required for update".to_string())
                })?;
                Ok(CartOperation::Update {
                    product_id,
                    quantity,
                })
            }
        }
    }

    pub fn action(&self) -> CartAction {
        match self {
            CartOperation::Add { .. } => CartAction::Add,
            CartOperation::Remove { .. } => CartAction::Remove,
            CartOperation::Update { .. } => CartAction::Update,
        }
    }

    pub fn product_id(&self) -> &str {
        match self {
            CartOperation::Add { product_id, .. }
            | CartOperation::Remove { product_id }
            | CartOperation::Update { product_id, .. } => product_id,
        }
    }
}

/// Apply one operation to the current lines and return the full new line list.
///
/// Remove of an absent line and update of an absent line are no-ops. An update
/// to zero or below removes the line.
pub fn reconcile(
    lines: &[CartLine],
    op: &CartOperation,
    actor: &str,
    now: DateTime<Utc>,
) -> Vec<CartLine> {
    let mut next = lines.to_vec();
    let existing = next
        .iter()
        .position(|line| line.external_product_id == op.product_id());

    match (op, existing) {
        (CartOperation::Add { quantity, .. }, Some(idx)) => {
            let requested = quantity.filter(|q| *q > 0).unwrap_or(1);
            next[idx].quantity = next[idx].quantity.saturating_add(requested);
        }
        (
            CartOperation::Add {
                product_id,
                quantity,
                snapshot,
            },
            None,
        ) => {
            let requested = quantity.filter(|q| *q > 0).unwrap_or(1);
            next.push(CartLine {
                external_product_id: product_id.clone(),
                quantity: requested,
                unit_price_snapshot: snapshot.price,
                product_snapshot: snapshot.clone(),
                added_by: actor.to_string(),
                added_at: now,
            });
        }
        (CartOperation::Remove { .. }, Some(idx)) => {
            next.remove(idx);
        }
        (CartOperation::Update { quantity, .. }, Some(idx)) => {
            if *quantity <= 0 {
                next.remove(idx);
            } else {
                next[idx].quantity = *quantity;
            }
        }
        (CartOperation::Remove { .. } | CartOperation::Update { .. }, None) => {}
    }

    next
}

pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

// ---- Read-side projection ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductView {
    pub id: String,
    pub name: String,
    pub price: f64,
    pub images: Vec<String>,
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItemView {
    pub product: ProductView,
    pub quantity: i64,
    pub line_total: f64,
    pub added_by: String,
    pub added_at: DateTime<Utc>,
}

/// Display shape of a cart: lines joined with their snapshots, plus totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartView {
    pub items: Vec<CartItemView>,
    pub item_count: i64,
    pub subtotal: f64,
}

impl CartView {
    pub fn project(lines: &[CartLine]) -> Self {
        let items: Vec<CartItemView> = lines
            .iter()
            .map(|line| CartItemView {
                product: ProductView {
                    id: line.external_product_id.clone(),
                    name: line.product_snapshot.name.clone(),
                    price: line.unit_price_snapshot,
                    images: line.product_snapshot.images.clone(),
                    image_url: line.product_snapshot.images.first().cloned(),
                    description: line.product_snapshot.description.clone(),
                },
                quantity: line.quantity,
                line_total: round_cents(line.unit_price_snapshot * line.quantity as f64),
                added_by: line.added_by.clone(),
                added_at: line.added_at,
            })
            .collect();
        let subtotal = round_cents(items.iter().map(|i| i.line_total).sum());
        let item_count = items.iter().map(|i| i.quantity).sum();
        Self {
            items,
            item_count,
            subtotal,
        }
    }
}

//! Checkout handoff: a priced snapshot of the shared cart plus payment splits,
//! consumed by the external order/payment service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{round_cents, CartItemView, CartView, Participant, Room};

/// The single source of tax and shipping rules.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingPolicy {
    pub tax_rate: f64,
    /// Orders strictly above this subtotal ship free.
    pub free_shipping_threshold: f64,
    pub shipping_fee: f64,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            tax_rate: 0.08,
            free_shipping_threshold: 35.0,
            shipping_fee: 5.99,
        }
    }
}

impl PricingPolicy {
    pub fn shipping_for(&self, subtotal: f64) -> f64 {
        if subtotal > self.free_shipping_threshold {
            0.0
        } else {
            self.shipping_fee
        }
    }

    pub fn totals(&self, subtotal: f64) -> Totals {
        let subtotal = round_cents(subtotal);
        let tax = round_cents(subtotal * self.tax_rate);
        let shipping = round_cents(self.shipping_for(subtotal));
        Totals {
            subtotal,
            tax,
            shipping,
            total: round_cents(subtotal + tax + shipping),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: f64,
    pub tax: f64,
    pub shipping: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomShare {
    pub participant_id: String,
    pub amount: f64,
}

/// How the total is divided between participants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SplitRequest {
    /// The requester pays everything.
    #[default]
    Single,
    Equal,
    Custom { splits: Vec<CustomShare> },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    #[serde(default)]
    pub split: SplitRequest,
    #[serde(default)]
    pub shipping_address: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSplit {
    pub participant_id: String,
    pub amount: f64,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSnapshot {
    pub room_id: Uuid,
    pub items: Vec<CartItemView>,
    pub participants: Vec<Participant>,
    pub totals: Totals,
    pub payment_splits: Vec<PaymentSplit>,
    pub shipping_address: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Price the room's cart and divide the total. Caller holds the room's mutation lock.
pub fn build_snapshot(
    room: &Room,
    requester: &str,
    request: CheckoutRequest,
    policy: &PricingPolicy,
    now: DateTime<Utc>,
) -> AppResult<CheckoutSnapshot> {
    room.ensure_participant(requester)?;
    if room.shared_cart.is_empty() {
        return Err(AppError::Validation("cart is empty".to_string()));
    }

    let view = CartView::project(&room.shared_cart);
    let totals = policy.totals(view.subtotal);
    let payment_splits = split_total(room, requester, &request.split, totals.total)?;

    Ok(CheckoutSnapshot {
        room_id: room.id,
        items: view.items,
        participants: room.participants.clone(),
        totals,
        payment_splits,
        shipping_address: request.shipping_address,
        created_at: now,
    })
}

fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

fn from_cents(cents: i64) -> f64 {
    cents as f64 / 100.0
}

fn pending(participant_id: &str, cents: i64) -> PaymentSplit {
    PaymentSplit {
        participant_id: participant_id.to_string(),
        amount: from_cents(cents),
        status: PaymentStatus::Pending,
    }
}

fn split_total(
    room: &Room,
    requester: &str,
    split: &SplitRequest,
    total: f64,
) -> AppResult<Vec<PaymentSplit>> {
    let total_cents = to_cents(total);
    match split {
        SplitRequest::Single => Ok(vec![pending(requester, total_cents)]),
        SplitRequest::Equal => {
            let mut members: Vec<&Participant> = room.participants.iter().collect();
            members.sort_by_key(|p| p.joined_at);
            let n = members.len() as i64;
            if n == 0 {
                return Err(AppError::Validation("room has no participants".to_string()));
            }
            let base = total_cents / n;
            let remainder = total_cents % n;
            Ok(members
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let extra = if (i as i64) < remainder { 1 } else { 0 };
                    pending(&p.user_id, base + extra)
                })
                .collect())
        }
        SplitRequest::Custom { splits } => {
            if splits.is_empty() {
                return Err(AppError::Validation("custom split needs at least one share".to_string()));
            }
            let mut seen = std::collections::HashSet::new();
            let mut sum = 0i64;
            let mut out = Vec::with_capacity(splits.len());
            for share in splits {
                if !room.is_participant(&share.participant_id) {
                    return Err(AppError::Validation(format!(
                        "'{}' is not a participant of this room",
                        share.participant_id
                    )));
                }
                if !seen.insert(share.participant_id.as_str()) {
                    return Err(AppError::Validation(format!(
                        "duplicate share for '{}'",
                        share.participant_id
                    )));
                }
                if !share.amount.is_finite() || to_cents(share.amount) <= 0 {
                    return Err(AppError::Validation(format!(
                        "share for '{}' must be positive",
                        share.participant_id
                    )));
                }
                let cents = to_cents(share.amount);
                sum += cents;
                out.push(pending(&share.participant_id, cents));
            }
            if sum != total_cents {
                return Err(AppError::Validation(format!(
                    "shares add up to {:.2}, expected {:.2}",
                    from_cents(sum),
                    from_cents(total_cents)
                )));
            }
            Ok(out)
        }
    }
}

//! Pre-flight affordability check and the post-flight charge.
//!
//! The charge is idempotent per request id and relies on the store's
//! conditional decrement for concurrency safety; nothing here locks.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::models::{GatewayContext, Model, Transaction, User};
use crate::store::{DebitOutcome, DebitRequest, GatewayStore};
use crate::translate::openai_types::Usage;

/// Floor for the completion estimate used by the pre-check.
const MIN_COMPLETION_ESTIMATE: u64 = 100;

/// Sell price of `prompt` input and `completion` output tokens.
pub fn price(model: &Model, prompt: u64, completion: u64) -> Decimal {
    price_of(model, Decimal::from(prompt), Decimal::from(completion))
}

fn price_of(model: &Model, prompt: Decimal, completion: Decimal) -> Decimal {
    let thousand = Decimal::from(1000u32);
    prompt / thousand * model.input_price + completion / thousand * model.output_price
}

/// Pessimistic completion size for a prompt of `prompt` tokens: half the
/// prompt, at least [`MIN_COMPLETION_ESTIMATE`].
pub fn completion_estimate(prompt: u64) -> Decimal {
    (Decimal::from(prompt) / Decimal::TWO).max(Decimal::from(MIN_COMPLETION_ESTIMATE))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeReceipt {
    pub revenue: Decimal,
    pub cost: Decimal,
    /// `None` when nothing was charged (zero-priced model).
    pub balance_after: Option<Decimal>,
    pub transaction_id: Option<uuid::Uuid>,
    /// The request had already been charged; these are the original figures.
    pub duplicate: bool,
}

impl ChargeReceipt {
    fn free() -> Self {
        Self {
            revenue: Decimal::ZERO,
            cost: Decimal::ZERO,
            balance_after: None,
            transaction_id: None,
            duplicate: false,
        }
    }

    fn from_transaction(tx: &Transaction, duplicate: bool) -> Self {
        Self {
            revenue: tx.revenue,
            cost: tx.cost,
            balance_after: Some(tx.balance_after),
            transaction_id: Some(tx.id),
            duplicate,
        }
    }
}

pub struct BillingLedger {
    store: Arc<dyn GatewayStore>,
    cost_ratio: Decimal,
}

impl BillingLedger {
    pub fn new(store: Arc<dyn GatewayStore>, cost_ratio: Decimal) -> Self {
        Self { store, cost_ratio }
    }

    /// Fail fast if `user` clearly cannot afford the request. Never mutates.
    pub fn pre_check_balance(&self, user: &User, model: &Model, estimated_prompt: u64) -> Result<()> {
        let required = price_of(
            model,
            Decimal::from(estimated_prompt),
            completion_estimate(estimated_prompt),
        );
        if user.balance < required {
            return Err(GatewayError::insufficient_balance(format!(
                "Insufficient balance: {} required, {} available",
                required.normalize(),
                user.balance.normalize()
            )));
        }
        Ok(())
    }

    /// Charge the request's actual usage exactly once.
    pub async fn charge_user(&self, ctx: &GatewayContext, usage: Usage) -> Result<ChargeReceipt> {
        let revenue = price(&ctx.model, usage.prompt_tokens, usage.completion_tokens);
        if revenue <= Decimal::ZERO {
            debug!(request_id = %ctx.request_id, "zero-priced request, nothing to charge");
            return Ok(ChargeReceipt::free());
        }

        if let Some(existing) = self.store.find_transaction(&ctx.request_id).await? {
            debug!(request_id = %ctx.request_id, "request already charged");
            return Ok(ChargeReceipt::from_transaction(&existing, true));
        }

        let outcome = self
            .store
            .debit(DebitRequest {
                user_id: ctx.user.id,
                api_key_id: ctx.api_key.id,
                reference_id: ctx.request_id.clone(),
                revenue,
                cost: revenue * self.cost_ratio,
                model: ctx.model.model_id.clone(),
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            })
            .await?;

        match outcome {
            DebitOutcome::Charged(tx) => {
                info!(
                    request_id = %ctx.request_id,
                    user_id = ctx.user.id,
                    revenue = %tx.revenue,
                    balance_after = %tx.balance_after,
                    "charged"
                );
                Ok(ChargeReceipt::from_transaction(&tx, false))
            }
            DebitOutcome::AlreadyCharged(tx) => Ok(ChargeReceipt::from_transaction(&tx, true)),
            DebitOutcome::InsufficientBalance => Err(GatewayError::insufficient_balance(format!(
                "Insufficient balance to pay {} for this request",
                revenue.normalize()
            ))),
        }
    }
}

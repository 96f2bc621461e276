//! Single-process store used when no database is configured, and by tests.
//!
//! One mutex guards all state, so a debit (balance check, decrement, ledger
//! append, quota bump) is atomic with respect to every other store call.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{DebitOutcome, DebitRequest, GatewayStore, StoreError};
use crate::auth::hash_token;
use crate::models::{ApiKey, AuthRecord, ChannelRecord, Model, Transaction, User, UsageLog};

#[derive(Debug, Default)]
struct State {
    users: HashMap<i64, User>,
    /// Keyed by token hash.
    api_keys: HashMap<String, ApiKey>,
    models: HashMap<String, Model>,
    channels: Vec<ChannelRecord>,
    transactions: Vec<Transaction>,
    usage_logs: Vec<UsageLog>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    api_key_lookups: AtomicUsize,
    channel_lookups: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn insert_user(&self, user: User) -> Result<(), StoreError> {
        self.lock()?.users.insert(user.id, user);
        Ok(())
    }

    /// Register a key under the hash of its plaintext token.
    pub fn insert_api_key(&self, token: &str, key: ApiKey) -> Result<(), StoreError> {
        self.lock()?.api_keys.insert(hash_token(token), key);
        Ok(())
    }

    pub fn insert_model(&self, model: Model) -> Result<(), StoreError> {
        self.lock()?.models.insert(model.model_id.clone(), model);
        Ok(())
    }

    pub fn insert_channel(&self, channel: ChannelRecord) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.channels.retain(|c| c.id != channel.id);
        state.channels.push(channel);
        Ok(())
    }

    pub fn balance(&self, user_id: i64) -> Result<Option<Decimal>, StoreError> {
        Ok(self.lock()?.users.get(&user_id).map(|u| u.balance))
    }

    pub fn used_quota(&self, api_key_id: i64) -> Result<Option<Decimal>, StoreError> {
        Ok(self
            .lock()?
            .api_keys
            .values()
            .find(|k| k.id == api_key_id)
            .map(|k| k.used_quota))
    }

    pub fn transactions(&self) -> Result<Vec<Transaction>, StoreError> {
        Ok(self.lock()?.transactions.clone())
    }

    pub fn usage_logs(&self) -> Result<Vec<UsageLog>, StoreError> {
        Ok(self.lock()?.usage_logs.clone())
    }

    /// How many times the backing key lookup ran (cache misses included).
    pub fn api_key_lookups(&self) -> usize {
        self.api_key_lookups.load(Ordering::Relaxed)
    }

    pub fn channel_lookups(&self) -> usize {
        self.channel_lookups.load(Ordering::Relaxed)
    }
}

/// `used_quota` never passes `total_quota`; the key stops authenticating once it reaches it.
fn capped_quota(used: Decimal, total: Option<Decimal>) -> Decimal {
    match total {
        Some(total) => used.min(total),
        None => used,
    }
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn find_api_key(&self, key_hash: &str) -> Result<Option<AuthRecord>, StoreError> {
        self.api_key_lookups.fetch_add(1, Ordering::Relaxed);
        let state = self.lock()?;
        let Some(api_key) = state.api_keys.get(key_hash) else {
            return Ok(None);
        };
        let Some(user) = state.users.get(&api_key.user_id) else {
            return Ok(None);
        };
        Ok(Some(AuthRecord {
            api_key: api_key.clone(),
            user: user.clone(),
        }))
    }

    async fn find_model(&self, model_id: &str) -> Result<Option<Model>, StoreError> {
        Ok(self.lock()?.models.get(model_id).cloned())
    }

    async fn list_active_models(&self) -> Result<Vec<Model>, StoreError> {
        let mut models: Vec<Model> = self
            .lock()?
            .models
            .values()
            .filter(|m| m.is_active)
            .cloned()
            .collect();
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(models)
    }

    async fn channels_for_model(&self, model_id: &str) -> Result<Vec<ChannelRecord>, StoreError> {
        self.channel_lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .lock()?
            .channels
            .iter()
            .filter(|c| c.models.iter().any(|m| m == model_id))
            .cloned()
            .collect())
    }

    async fn find_transaction(&self, reference_id: &str) -> Result<Option<Transaction>, StoreError> {
        Ok(self
            .lock()?
            .transactions
            .iter()
            .find(|t| t.reference_id == reference_id)
            .cloned())
    }

    async fn debit(&self, req: DebitRequest) -> Result<DebitOutcome, StoreError> {
        let mut state = self.lock()?;

        if let Some(existing) = state
            .transactions
            .iter()
            .find(|t| t.reference_id == req.reference_id)
        {
            return Ok(DebitOutcome::AlreadyCharged(existing.clone()));
        }

        let Some(user) = state.users.get_mut(&req.user_id) else {
            return Ok(DebitOutcome::InsufficientBalance);
        };
        if user.balance < req.revenue {
            return Ok(DebitOutcome::InsufficientBalance);
        }
        user.balance -= req.revenue;
        let balance_after = user.balance;

        if let Some(key) = state.api_keys.values_mut().find(|k| k.id == req.api_key_id) {
            key.used_quota = capped_quota(key.used_quota + req.revenue, key.total_quota);
        }

        let tx = Transaction {
            id: uuid::Uuid::new_v4(),
            user_id: req.user_id,
            api_key_id: req.api_key_id,
            reference_id: req.reference_id,
            amount: -req.revenue,
            revenue: req.revenue,
            cost: req.cost,
            balance_after,
            model: req.model,
            prompt_tokens: req.prompt_tokens,
            completion_tokens: req.completion_tokens,
            created_at: Utc::now(),
        };
        state.transactions.push(tx.clone());
        Ok(DebitOutcome::Charged(tx))
    }

    async fn insert_usage_log(&self, log: UsageLog) -> Result<(), StoreError> {
        self.lock()?.usage_logs.push(log);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn store_with_user(balance: Decimal) -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_user(User { id: 1, balance }).unwrap();
        store
            .insert_api_key(
                "sk-test",
                ApiKey {
                    id: 10,
                    user_id: 1,
                    is_active: true,
                    expires_at: None,
                    total_quota: None,
                    used_quota: Decimal::ZERO,
                    rate_limit_per_minute: None,
                    model_whitelist: vec![],
                },
            )
            .unwrap();
        store
    }

    fn debit(reference: &str, revenue: Decimal) -> DebitRequest {
        DebitRequest {
            user_id: 1,
            api_key_id: 10,
            reference_id: reference.to_string(),
            revenue,
            cost: revenue * dec("0.7"),
            model: "gpt-4o".to_string(),
            prompt_tokens: 10,
            completion_tokens: 5,
        }
    }

    #[tokio::test]
    async fn test_debit_moves_balance_and_quota_together() {
        let store = store_with_user(dec("1.00"));
        let outcome = store.debit(debit("req-1", dec("0.25"))).await.unwrap();

        let DebitOutcome::Charged(tx) = outcome else {
            panic!("expected a charge, got {outcome:?}");
        };
        assert_eq!(tx.amount, dec("-0.25"));
        assert_eq!(tx.balance_after, dec("0.75"));
        assert_eq!(store.balance(1).unwrap(), Some(dec("0.75")));
        assert_eq!(store.used_quota(10).unwrap(), Some(dec("0.25")));
    }

    #[tokio::test]
    async fn test_debit_refuses_overdraw() {
        let store = store_with_user(dec("0.10"));
        let outcome = store.debit(debit("req-1", dec("0.25"))).await.unwrap();
        assert_eq!(outcome, DebitOutcome::InsufficientBalance);
        assert_eq!(store.balance(1).unwrap(), Some(dec("0.10")));
        assert!(store.transactions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_debit_same_reference_once() {
        let store = store_with_user(dec("1.00"));
        store.debit(debit("req-1", dec("0.25"))).await.unwrap();
        let again = store.debit(debit("req-1", dec("0.25"))).await.unwrap();
        assert!(matches!(again, DebitOutcome::AlreadyCharged(_)));
        assert_eq!(store.balance(1).unwrap(), Some(dec("0.75")));
        assert_eq!(store.transactions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_api_key_lookup_by_hash() {
        let store = store_with_user(dec("1.00"));
        let found = store.find_api_key(&hash_token("sk-test")).await.unwrap();
        assert_eq!(found.unwrap().user.id, 1);
        assert!(store.find_api_key(&hash_token("sk-other")).await.unwrap().is_none());
        assert_eq!(store.api_key_lookups(), 2);
    }
}

//! Channel selection: highest priority class first, weighted random within it.

use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{ReadThrough, SharedCache};
use crate::error::{GatewayError, Result};
use crate::models::ChannelRecord;
use crate::store::GatewayStore;

/// Pick one channel from the top-priority class, proportionally to weight.
///
/// Returns `None` only for an empty slice. A lone top-priority candidate is
/// returned without drawing; a class whose weights sum to zero is drawn uniformly.
pub fn select_weighted<'a, R: Rng + ?Sized>(
    candidates: &'a [ChannelRecord],
    rng: &mut R,
) -> Option<&'a ChannelRecord> {
    let top = candidates.iter().map(|c| c.priority).max()?;
    let tier: Vec<&ChannelRecord> = candidates.iter().filter(|c| c.priority == top).collect();

    if let [only] = tier.as_slice() {
        return Some(*only);
    }

    let total: f64 = tier.iter().map(|c| f64::from(c.weight)).sum();
    if total <= 0.0 {
        return tier.get(rng.random_range(0..tier.len())).copied();
    }

    let mut remaining = rng.random::<f64>() * total;
    for &channel in &tier {
        remaining -= f64::from(channel.weight);
        if remaining <= 0.0 {
            return Some(channel);
        }
    }
    // Float rounding can leave a sliver past the last candidate.
    tier.last().copied()
}

pub struct ChannelRouter {
    store: Arc<dyn GatewayStore>,
    lookup: ReadThrough<Vec<ChannelRecord>>,
}

impl ChannelRouter {
    pub fn new(store: Arc<dyn GatewayStore>, cache: Arc<dyn SharedCache>, ttl: Duration) -> Self {
        Self {
            store,
            lookup: ReadThrough::new(cache, "channels", ttl),
        }
    }

    /// All channels serving `model`, possibly up to the cache TTL stale.
    pub async fn candidates(&self, model: &str) -> Result<Vec<ChannelRecord>> {
        let channels = self
            .lookup
            .get_or_load(model, || async {
                self.store
                    .channels_for_model(model)
                    .await
                    .map(Some)
                    .map_err(GatewayError::from)
            })
            .await?;
        Ok(channels.unwrap_or_default())
    }

    pub async fn select(&self, model: &str, excluded: &HashSet<i64>) -> Result<ChannelRecord> {
        let mut candidates = self.candidates(model).await?;
        candidates.retain(|c| !excluded.contains(&c.id));

        select_weighted(&candidates, &mut rand::rng())
            .cloned()
            .ok_or_else(|| GatewayError::NoAvailableChannel {
                model: model.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::store::MemoryStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn channel(id: i64, priority: i32, weight: u32) -> ChannelRecord {
        ChannelRecord {
            id,
            provider: "openai".to_string(),
            encrypted_key: format!("plain:sk-{id}"),
            base_url: String::new(),
            priority,
            weight,
            models: vec!["gpt-4o".to_string()],
        }
    }

    #[test]
    fn test_priority_class_and_weights() {
        let channels = vec![channel(1, 5, 1), channel(2, 5, 3), channel(3, 1, 100)];
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = [0u32; 4];
        for _ in 0..20_000 {
            let picked = select_weighted(&channels, &mut rng).unwrap();
            counts[picked.id as usize] += 1;
        }
        assert_eq!(counts[3], 0);
        let ratio = f64::from(counts[2]) / f64::from(counts[1]);
        assert!((2.7..3.3).contains(&ratio), "ratio was {ratio}");
    }

    #[test]
    fn test_single_and_empty() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(select_weighted(&[], &mut rng).is_none());

        let channels = vec![channel(9, 0, 0)];
        assert_eq!(select_weighted(&channels, &mut rng).unwrap().id, 9);
    }

    #[test]
    fn test_zero_weights_still_selectable() {
        let channels = vec![channel(1, 0, 0), channel(2, 0, 0)];
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = HashSet::new();
        for _ in 0..100 {
            seen.insert(select_weighted(&channels, &mut rng).unwrap().id);
        }
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_select_honors_exclusions_and_caches() {
        let store = Arc::new(MemoryStore::new());
        store.insert_channel(channel(1, 5, 1)).unwrap();
        store.insert_channel(channel(2, 1, 1)).unwrap();
        let router = ChannelRouter::new(
            store.clone(),
            Arc::new(MemoryCache::new()),
            Duration::from_secs(30),
        );

        let mut excluded = HashSet::new();
        assert_eq!(router.select("gpt-4o", &excluded).await.unwrap().id, 1);
        excluded.insert(1);
        assert_eq!(router.select("gpt-4o", &excluded).await.unwrap().id, 2);
        excluded.insert(2);
        let err = router.select("gpt-4o", &excluded).await.unwrap_err();
        assert_eq!(err.code(), "no_available_channel");

        let err = router.select("unknown", &HashSet::new()).await.unwrap_err();
        assert_eq!(err.code(), "no_available_channel");

        // "gpt-4o" loaded once, "unknown" once.
        assert_eq!(store.channel_lookups(), 2);
    }
}

//! Daily/monthly call and credit counters, anchored to UTC boundaries, that
//! live inline on each [`KeyRecord`](crate::keystore::KeyRecord)'s `quota`
//! field. `QuotaTracker` is a thin façade over the `KeyStore` so the gate
//! pipeline can treat quota checks as a component with its own contract
//! (`check`/`record`/`resetIfNeeded`) even though the counters are part of
//! the key's own state for atomicity.

use std::sync::Arc;

use chrono::Utc;

use crate::keystore::{quota_rollover, KeyStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDenyReason {
    DailyCallLimit,
    MonthlyCallLimit,
    DailyCreditLimit,
    MonthlyCreditLimit,
}

pub struct QuotaTracker {
    store: Arc<KeyStore>,
}

impl QuotaTracker {
    pub fn new(store: Arc<KeyStore>) -> Self {
        Self { store }
    }

    /// Rolls over any stale anchor before checking. Returns `Ok(None)` when
    /// the call is within quota (or the key has none), `Ok(Some(reason))`
    /// when it would exceed a limit.
    pub async fn check(
        &self,
        key: &str,
        credits: i64,
    ) -> Result<Option<QuotaDenyReason>, StoreError> {
        self.reset_if_needed(key).await?;
        let record = self.store.get_key_raw(key).await?;
        let Some(quota) = record.quota else {
            return Ok(None);
        };
        if let Some(limit) = quota.daily_call_limit {
            if quota.daily_calls + 1 > limit {
                return Ok(Some(QuotaDenyReason::DailyCallLimit));
            }
        }
        if let Some(limit) = quota.monthly_call_limit {
            if quota.monthly_calls + 1 > limit {
                return Ok(Some(QuotaDenyReason::MonthlyCallLimit));
            }
        }
        if let Some(limit) = quota.daily_credit_limit {
            if quota.daily_credits + credits > limit {
                return Ok(Some(QuotaDenyReason::DailyCreditLimit));
            }
        }
        if let Some(limit) = quota.monthly_credit_limit {
            if quota.monthly_credits + credits > limit {
                return Ok(Some(QuotaDenyReason::MonthlyCreditLimit));
            }
        }
        Ok(None)
    }

    pub async fn record(&self, key: &str, credits: i64) -> Result<(), StoreError> {
        self.store
            .mutate(key, |r| {
                if let Some(quota) = r.quota.as_mut() {
                    quota.daily_calls += 1;
                    quota.daily_credits += credits;
                    quota.monthly_calls += 1;
                    quota.monthly_credits += credits;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn reset_if_needed(&self, key: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        self.store
            .mutate(key, |r| {
                if let Some(quota) = r.quota.as_mut() {
                    quota_rollover(quota, now);
                }
                Ok(())
            })
            .await?;
        Ok(())
    }
}

impl QuotaDenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaDenyReason::DailyCallLimit => "quota_daily_calls",
            QuotaDenyReason::MonthlyCallLimit => "quota_monthly_calls",
            QuotaDenyReason::DailyCreditLimit => "quota_daily_credits",
            QuotaDenyReason::MonthlyCreditLimit => "quota_monthly_credits",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::{NewKeyOpts, Quota};

    #[tokio::test]
    async fn denies_when_daily_call_limit_reached() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KeyStore::load(dir.path().join("keys.json")).await);
        let mut opts = NewKeyOpts::default();
        opts.quota = Some(Quota {
            daily_call_limit: Some(1),
            ..Default::default()
        });
        let rec = store.create_key("t".into(), 100, opts).await.unwrap();
        let tracker = QuotaTracker::new(store.clone());
        assert_eq!(tracker.check(&rec.key, 1).await.unwrap(), None);
        tracker.record(&rec.key, 1).await.unwrap();
        assert_eq!(
            tracker.check(&rec.key, 1).await.unwrap(),
            Some(QuotaDenyReason::DailyCallLimit)
        );
    }
}

//! Last-known contract reads.
//!
//! The cache is split into independently refreshed groups. A group is only
//! ever replaced whole, so readers never observe a half-updated group.

use std::collections::BTreeSet;

use primitive_types::U256;
use serde::Serialize;

use crate::{state::now_ms, units::wei_string};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamped<T> {
    pub value: T,
    pub fetched_at_ms: u64,
}

impl<T> Timestamped<T> {
    pub fn now(value: T) -> Self {
        Self {
            value,
            fetched_at_ms: now_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleParams {
    pub sale_active: bool,
    #[serde(with = "wei_string")]
    pub min_buy_wei: U256,
    /// Token base units received per whole native coin.
    #[serde(with = "wei_string")]
    pub tokens_per_bnb: U256,
    #[serde(with = "wei_string")]
    pub available_tokens: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Balances {
    #[serde(with = "wei_string")]
    pub native_wei: U256,
    #[serde(with = "wei_string")]
    pub token_wei: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StakePosition {
    pub index: u64,
    #[serde(with = "wei_string")]
    pub amount_wei: U256,
    /// Unix seconds.
    pub start_time: u64,
    pub duration_days: u64,
    /// Unix seconds.
    pub unlock_time: u64,
    pub can_withdraw: bool,
}

impl StakePosition {
    pub fn seconds_left(&self, now_secs: u64) -> u64 {
        self.unlock_time.saturating_sub(now_secs)
    }
}

/// Which cache group a refresh result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheGroup {
    Sale,
    Balances,
    Stakes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadCache {
    pub sale: Option<Timestamped<SaleParams>>,
    pub balances: Option<Timestamped<Balances>>,
    pub stakes: Option<Timestamped<Vec<StakePosition>>>,
    /// Set while at least one group's latest refresh failed.
    pub stale: bool,
    #[serde(skip)]
    failing: BTreeSet<CacheGroup>,
}

impl ReadCache {
    /// Drop everything tied to the connected account; sale-wide data stays.
    pub fn clear_user_scoped(&mut self) {
        self.balances = None;
        self.stakes = None;
        self.failing.remove(&CacheGroup::Balances);
        self.failing.remove(&CacheGroup::Stakes);
        self.stale = !self.failing.is_empty();
    }

    /// Note the result of a group's latest read and update `stale`.
    pub fn record(&mut self, group: CacheGroup, ok: bool) {
        if ok {
            self.failing.remove(&group);
        } else {
            self.failing.insert(group);
        }
        self.stale = !self.failing.is_empty();
    }

    pub fn clear(&mut self) {
        *self = ReadCache::default();
    }

    pub fn has(&self, group: CacheGroup) -> bool {
        match group {
            CacheGroup::Sale => self.sale.is_some(),
            CacheGroup::Balances => self.balances.is_some(),
            CacheGroup::Stakes => self.stakes.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled() -> ReadCache {
        ReadCache {
            sale: Some(Timestamped::now(SaleParams {
                sale_active: true,
                min_buy_wei: U256::from(1u64),
                tokens_per_bnb: U256::from(2u64),
                available_tokens: U256::from(3u64),
            })),
            balances: Some(Timestamped::now(Balances {
                native_wei: U256::from(4u64),
                token_wei: U256::from(5u64),
            })),
            stakes: Some(Timestamped::now(Vec::new())),
            ..ReadCache::default()
        }
    }

    #[test]
    fn clear_user_scoped_keeps_sale() {
        let mut cache = filled();
        cache.clear_user_scoped();
        assert!(cache.has(CacheGroup::Sale));
        assert!(!cache.has(CacheGroup::Balances));
        assert!(!cache.has(CacheGroup::Stakes));
    }

    #[test]
    fn stale_tracks_each_group() {
        let mut cache = filled();
        cache.record(CacheGroup::Sale, false);
        cache.record(CacheGroup::Stakes, false);
        assert!(cache.stale);

        cache.record(CacheGroup::Sale, true);
        assert!(cache.stale, "stakes still failing");
        cache.clear_user_scoped();
        assert!(!cache.stale);

        cache.record(CacheGroup::Balances, false);
        cache.clear();
        assert!(!cache.stale);
    }

    #[test]
    fn amounts_serialize_as_strings() {
        let json = serde_json::to_value(filled()).unwrap();
        assert_eq!(json["sale"]["value"]["minBuyWei"], "1");
        assert_eq!(json["balances"]["value"]["tokenWei"], "5");
        assert!(json.get("failing").is_none());
    }

    #[test]
    fn seconds_left_saturates() {
        let stake = StakePosition {
            index: 0,
            amount_wei: U256::one(),
            start_time: 100,
            duration_days: 1,
            unlock_time: 100 + 86_400,
            can_withdraw: false,
        };
        assert_eq!(stake.seconds_left(100), 86_400);
        assert_eq!(stake.seconds_left(1_000_000), 0);
    }
}

//! Shared groups pool the balances of several accounts

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::utils::consts::ANY;
use crate::utils::StringMap;

pub const MINE_PREFIX: &str = "*mine_";
pub const STRATEGY_MINE_LOWEST: &str = "*mine_lowest";
pub const STRATEGY_MINE_HIGHEST: &str = "*mine_highest";
pub const STRATEGY_MINE_RANDOM: &str = "*mine_random";
pub const STRATEGY_LOWEST: &str = "*lowest";
pub const STRATEGY_HIGHEST: &str = "*highest";
pub const STRATEGY_RANDOM: &str = "*random";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SharingParam {
    pub strategy: String,
    pub rating_subject: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SharedGroup {
    pub tenant: String,
    pub name: String,
    /// Sharing parameters per member account, `*any` for the rest
    pub account_parameters: BTreeMap<String, SharingParam>,
    #[serde(rename = "MemberIDs")]
    pub member_ids: StringMap,
}

impl SharedGroup {
    /// Strategy applying to `account`, `*mine_random` when none is configured
    pub fn strategy_for(&self, account: &str) -> &str {
        let params = self
            .account_parameters
            .get(account)
            .or_else(|| self.account_parameters.get(ANY));
        match params.map(|p| p.strategy.as_str()) {
            Some(s @ (STRATEGY_LOWEST | STRATEGY_MINE_LOWEST | STRATEGY_HIGHEST
            | STRATEGY_MINE_HIGHEST | STRATEGY_RANDOM | STRATEGY_MINE_RANDOM)) => s,
            _ => STRATEGY_MINE_RANDOM,
        }
    }
}

/// Orders pooled items by `strategy`; `*mine_*` strategies then move the
/// first item satisfying `mine` to the head
pub fn sort_by_strategy<T>(
    strategy: &str,
    items: &mut [T],
    value: impl Fn(&T) -> Decimal,
    mine: impl Fn(&T) -> bool,
) {
    match strategy {
        STRATEGY_LOWEST | STRATEGY_MINE_LOWEST => items.sort_by_key(|i| value(i)),
        STRATEGY_HIGHEST | STRATEGY_MINE_HIGHEST => {
            items.sort_by(|a, b| value(b).cmp(&value(a)))
        }
        _ => items.shuffle(&mut rand::thread_rng()),
    }
    if strategy.starts_with(MINE_PREFIX) {
        if let Some(i) = items.iter().position(|it| mine(it)) {
            items.swap(0, i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn group(strategy: &str) -> SharedGroup {
        let mut params = BTreeMap::new();
        params.insert(
            ANY.to_string(),
            SharingParam {
                strategy: strategy.into(),
                rating_subject: String::new(),
            },
        );
        SharedGroup {
            tenant: "test".into(),
            name: "SG1".into(),
            account_parameters: params,
            member_ids: StringMap::from_items(["a", "b", "c"]),
        }
    }

    #[test]
    fn test_strategy_fallbacks() {
        assert_eq!(group("*highest").strategy_for("a"), STRATEGY_HIGHEST);
        assert_eq!(group("bogus").strategy_for("a"), STRATEGY_MINE_RANDOM);
        assert_eq!(SharedGroup::default().strategy_for("a"), STRATEGY_MINE_RANDOM);
    }

    #[test]
    fn test_sort_highest_and_mine_lowest() {
        let mut items = vec![("a", dec!(1)), ("b", dec!(5)), ("c", dec!(3))];
        sort_by_strategy(STRATEGY_HIGHEST, &mut items, |i| i.1, |i| i.0 == "a");
        assert_eq!(items.iter().map(|i| i.0).collect::<Vec<_>>(), ["b", "c", "a"]);

        sort_by_strategy(STRATEGY_MINE_LOWEST, &mut items, |i| i.1, |i| i.0 == "c");
        assert_eq!(items[0].0, "c");
    }

    #[test]
    fn test_mine_random_puts_mine_first() {
        for _ in 0..10 {
            let mut items = vec![("a", dec!(1)), ("b", dec!(5)), ("c", dec!(3))];
            sort_by_strategy(STRATEGY_MINE_RANDOM, &mut items, |i| i.1, |i| i.0 == "b");
            assert_eq!(items[0].0, "b");
        }
    }
}

//! Debit only accounts holding one decimal per category

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::utils::concatenated_key;
use crate::AppResult;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SimpleAccount {
    pub tenant: String,
    pub name: String,
    pub balance_map: BTreeMap<String, Decimal>,
    /// Absolute cap on any category balance, unset or zero for none
    pub max_balance: Option<Decimal>,
    pub disabled: bool,
}

impl SimpleAccount {
    pub fn new(tenant: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn full_id(&self) -> String {
        concatenated_key(&[&self.tenant, &self.name])
    }

    pub fn balance(&self, category: &str) -> Decimal {
        self.balance_map.get(category).copied().unwrap_or_default()
    }

    /// Subtracts `value` from the category balance
    ///
    /// Refused on disabled accounts and once the balance sits at the cap in
    /// either direction.
    pub fn debit(&mut self, category: &str, value: Decimal) -> AppResult<()> {
        if self.disabled {
            return Err(AppError::AccountDisabled);
        }
        if let Some(max) = self.max_balance.filter(|m| *m > Decimal::ZERO) {
            if let Some(b) = self.balance_map.get(category) {
                if (*b > Decimal::ZERO && *b >= max) || (*b < Decimal::ZERO && *b <= -max) {
                    return Err(AppError::QuotaExceeded);
                }
            }
        }
        *self.balance_map.entry(category.to_string()).or_default() -= value;
        Ok(())
    }

    /// Sets the category balance; a positive value above the cap is refused
    pub fn set_value(&mut self, category: &str, value: Decimal) -> AppResult<()> {
        if self.disabled {
            return Err(AppError::AccountDisabled);
        }
        if let Some(max) = self.max_balance.filter(|m| *m > Decimal::ZERO) {
            if value > max {
                return Err(AppError::InsufficientCredit);
            }
        }
        self.balance_map.insert(category.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_debit_creates_category() {
        let mut sa = SimpleAccount::new("test", "sa1");
        sa.debit("call", dec!(1.5)).unwrap();
        assert_eq!(sa.balance("call"), dec!(-1.5));
    }

    #[test]
    fn test_quota() {
        let mut sa = SimpleAccount::new("test", "sa1");
        sa.max_balance = Some(dec!(10));
        sa.set_value("call", dec!(10)).unwrap();
        assert_eq!(sa.debit("call", dec!(1)), Err(AppError::QuotaExceeded));
        sa.set_value("call", dec!(-10)).unwrap();
        assert_eq!(sa.debit("call", dec!(1)), Err(AppError::QuotaExceeded));
        sa.set_value("call", dec!(3)).unwrap();
        sa.debit("call", dec!(1)).unwrap();
        assert_eq!(sa.balance("call"), dec!(2));
        assert_eq!(sa.set_value("call", dec!(11)), Err(AppError::InsufficientCredit));
    }

    #[test]
    fn test_disabled() {
        let mut sa = SimpleAccount::new("test", "sa1");
        sa.disabled = true;
        assert_eq!(sa.debit("call", dec!(1)), Err(AppError::AccountDisabled));
    }
}

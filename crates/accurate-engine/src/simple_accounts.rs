//! Simple accounts: one decimal per category, debited for rated CDRs

use accurate_core::models::SimpleAccount;
use accurate_core::{AppError, AppResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::Engine;

/// Creation request for a simple account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AttrNewSimpleAccount {
    pub tenant: String,
    pub name: String,
    pub disabled: bool,
    pub max_balance: Option<Decimal>,
}

/// Category value of a simple account, for debits and sets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AttrSimpleAccountValue {
    pub tenant: String,
    pub name: String,
    pub category: String,
    pub value: Decimal,
}

fn lock_key(tenant: &str, name: &str) -> Vec<String> {
    vec![format!("*sa:{}:{}", tenant, name)]
}

impl Engine {
    pub async fn new_simple_account(&self, attr: AttrNewSimpleAccount) -> AppResult<()> {
        if attr.tenant.is_empty() || attr.name.is_empty() {
            return Err(AppError::missing(["Tenant", "Name"]));
        }
        let acc = SimpleAccount {
            disabled: attr.disabled,
            max_balance: attr.max_balance,
            ..SimpleAccount::new(attr.tenant, attr.name)
        };
        self.accounting.set_simple_account(&acc).await
    }

    pub async fn get_simple_account(&self, tenant: &str, name: &str) -> AppResult<SimpleAccount> {
        self.accounting.get_simple_account(tenant, name).await
    }

    pub async fn remove_simple_account(&self, tenant: &str, name: &str) -> AppResult<()> {
        if !self.accounting.remove_simple_account(tenant, name).await? {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    /// Loads, changes and stores a simple account under its lock
    async fn update_simple_account<F>(&self, tenant: &str, name: &str, change: F) -> AppResult<()>
    where
        F: FnOnce(&mut SimpleAccount) -> AppResult<()>,
    {
        self.guardian
            .guard(&lock_key(tenant, name), self.lock_timeout(), || async move {
                let mut acc = self.accounting.get_simple_account(tenant, name).await?;
                change(&mut acc)?;
                self.accounting.set_simple_account(&acc).await
            })
            .await
    }

    #[instrument(skip(self, attr), fields(account = %attr.name, category = %attr.category, value = %attr.value))]
    pub async fn debit_simple_account(&self, attr: &AttrSimpleAccountValue) -> AppResult<()> {
        self.update_simple_account(&attr.tenant, &attr.name, |acc| acc.debit(&attr.category, attr.value))
            .await
    }

    pub async fn set_simple_account_value(&self, attr: &AttrSimpleAccountValue) -> AppResult<()> {
        self.update_simple_account(&attr.tenant, &attr.name, |acc| acc.set_value(&attr.category, attr.value))
            .await
    }

    pub async fn set_simple_account_disabled(&self, tenant: &str, name: &str, disabled: bool) -> AppResult<()> {
        self.update_simple_account(tenant, name, |acc| {
            acc.disabled = disabled;
            Ok(())
        })
        .await
    }

    pub async fn set_simple_account_max_balance(
        &self,
        tenant: &str,
        name: &str,
        max_balance: Option<Decimal>,
    ) -> AppResult<()> {
        self.update_simple_account(tenant, name, |acc| {
            acc.max_balance = max_balance;
            Ok(())
        })
        .await
    }

    /// Debits the simple account of a rated call, if one exists
    pub(crate) async fn debit_rated_call(&self, tenant: &str, name: &str, category: &str, cost: Decimal) -> AppResult<()> {
        let attr = AttrSimpleAccountValue {
            tenant: tenant.to_string(),
            name: name.to_string(),
            category: category.to_string(),
            value: cost,
        };
        match self.debit_simple_account(&attr).await {
            Err(AppError::AccountNotFound) => {
                debug!(tenant, account = name, "no simple account to debit");
                Ok(())
            }
            other => other,
        }
    }
}

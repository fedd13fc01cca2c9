//! Domain models for Accurate
//!
//! Tariff plan entities (destinations, rating plans, actions, triggers,
//! chargers, LCR rules), accounting entities (accounts, balances, aliases,
//! users, stats queues) and the records the rating engine produces.

pub mod account;
pub mod action;
pub mod alias;
pub mod balance;
pub mod callcost;
pub mod cdr;
pub mod derived;
pub mod destination;
pub mod lcr;
pub mod rating;
pub mod shared_group;
pub mod simple_account;
pub mod stats;
pub mod timespan;
pub mod trigger;
pub mod user;
pub mod version;

pub use account::{Account, AccountSummary, CounterFilter, UnitCounter, UnitCounters};
pub use action::{Action, ActionGroup, ActionPlan, ActionPlanBinding, ActionTiming, Task};
pub use alias::{Alias, AliasIndex, AliasValue, AttrAddAlias, AttrAlias, AttrReverseAlias};
pub use balance::{Balance, BalanceSummary, ValueFactor};
pub use callcost::{CallCost, CallDescriptor};
pub use cdr::{Cdr, CdrsFilter, SmCost};
pub use derived::{AttrDerivedChargers, DerivedCharger, DerivedChargerGroup, SessionRun};
pub use destination::Destination;
pub use lcr::{Lcr, LcrActivation, LcrCost, LcrEntry, LcrReply, LcrRequest, LcrSupplierCost};
pub use rating::{
    RITiming, RIRate, RateInfo, RateInterval, RatingInfo, RatingPlan, RatingPlanActivation,
    RatingProfile,
};
pub use shared_group::{SharedGroup, SharingParam};
pub use simple_account::SimpleAccount;
pub use stats::{
    AttrStatsQueueDisable, AttrStatsQueueId, AttrStatsQueueIds, CdrStats, Metric, QCdr,
    StatsQueueState,
};
pub use timespan::{DebitInfo, Increment, MonetaryInfo, TimeSpan, UnitInfo};
pub use trigger::{ActionTrigger, ActionTriggerGroup, ActionTriggerRecord};
pub use user::{AttrGetUsers, UserProfile};
pub use version::{LoadInstance, MigrationInfo, StructVersion};

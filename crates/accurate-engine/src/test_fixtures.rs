//! Shared tariff data for unit tests
//!
//! Tenant `cgrates.org`:
//! - destinations NAT `0723`, RET `0723045`, NAT2 `0256`, GERMANY `+49`,
//!   GERMANY_MOBILE `+4915`
//! - `dan` pays 0.01/s to `0723` and 0.05/s plus 0.1 connect fee to `+49`
//! - `*any` pays 0.02/s to `0723`

use std::sync::Arc;

use accurate_core::models::{
    Account, Balance, CallDescriptor, Destination, RIRate, RateInfo, RateInterval, RatingPlan,
    RatingPlanActivation, RatingProfile, SharedGroup, SharingParam,
};
use accurate_core::utils::consts::{ANY, MONETARY, OUT, VOICE};
use accurate_core::utils::{gen_uuid, StringMap};
use accurate_core::AppConfig;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::Engine;

pub const TENANT: &str = "cgrates.org";

pub fn call_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
}

pub fn per_second(value: Decimal, connect_fee: Decimal) -> RateInterval {
    RateInterval {
        rating: RIRate {
            connect_fee,
            rates: vec![RateInfo {
                group_interval_start: Duration::zero(),
                value,
                rate_increment: Duration::seconds(1),
                rate_unit: Duration::seconds(1),
            }],
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Stores a profile for `subject` activating `plan` on 2020-01-01
pub async fn rating_profile(engine: &Engine, subject: &str, plan: &str) {
    category_profile(engine, "call", subject, plan, &[]).await;
}

pub async fn category_profile(engine: &Engine, category: &str, subject: &str, plan: &str, stat_queues: &[&str]) {
    let rpf = RatingProfile {
        direction: OUT.into(),
        tenant: TENANT.into(),
        category: category.into(),
        subject: subject.into(),
        rating_plan_activations: vec![RatingPlanActivation {
            activation_time: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            rating_plan_id: plan.into(),
            cdr_stat_queue_ids: stat_queues.iter().map(|q| q.to_string()).collect(),
            ..Default::default()
        }],
    };
    engine.tariff.set_rating_profile(&rpf, None).await.unwrap();
}

pub async fn engine_with_tariffs() -> Arc<Engine> {
    engine_with_config(AppConfig::default()).await
}

pub async fn engine_with_config(cfg: AppConfig) -> Arc<Engine> {
    let engine = Arc::new(Engine::in_memory(cfg));
    for (code, name) in [
        ("0723", "NAT"),
        ("0723045", "RET"),
        ("0256", "NAT2"),
        ("+49", "GERMANY"),
        ("+4915", "GERMANY_MOBILE"),
    ] {
        engine
            .tariff
            .set_destination(&Destination::new(TENANT, code, name), None)
            .await
            .unwrap();
    }

    let mut dan = RatingPlan::new(TENANT, "RP_DAN");
    dan.add_rate_interval("0723", "NAT", &[per_second(dec!(0.01), dec!(0))]);
    dan.add_rate_interval("+49", "GERMANY", &[per_second(dec!(0.05), dec!(0.1))]);
    engine.tariff.set_rating_plan(&dan, None).await.unwrap();

    let mut any = RatingPlan::new(TENANT, "RP_ANY");
    any.add_rate_interval("0723", "NAT", &[per_second(dec!(0.02), dec!(0))]);
    engine.tariff.set_rating_plan(&any, None).await.unwrap();

    rating_profile(&engine, "dan", "RP_DAN").await;
    rating_profile(&engine, ANY, "RP_ANY").await;
    engine
}

pub fn descriptor(name: &str, destination: &str, secs: i64) -> CallDescriptor {
    CallDescriptor {
        direction: OUT.into(),
        tenant: TENANT.into(),
        category: "call".into(),
        subject: name.into(),
        account: name.into(),
        destination: destination.into(),
        tor: VOICE.into(),
        time_start: call_start(),
        time_end: call_start() + Duration::seconds(secs),
        duration_index: Duration::seconds(secs),
        ..Default::default()
    }
}

pub fn account(name: &str) -> Account {
    Account::new(TENANT, name)
}

/// Stores an account holding `money` in one monetary balance
pub async fn funded(engine: &Engine, name: &str, money: Decimal) {
    let mut acc = account(name);
    acc.balance_map.insert(MONETARY.into(), vec![balance("MONEY", money, &[], 10.0)]);
    engine.accounting.set_account(&acc).await.unwrap();
}

pub async fn money(engine: &Engine, name: &str) -> Decimal {
    let acc = engine.accounting.get_account(TENANT, name).await.unwrap();
    acc.balances(MONETARY).iter().map(|b| b.value).sum()
}

pub fn balance(id: &str, value: Decimal, destinations: &[&str], weight: f64) -> Balance {
    Balance {
        uuid: gen_uuid(),
        id: id.into(),
        value,
        weight,
        destination_ids: StringMap::from_items(destinations.iter().copied()),
        ..Default::default()
    }
}

pub async fn shared_group(engine: &Engine, name: &str, strategy: &str, members: &[&str]) {
    let sg = SharedGroup {
        tenant: TENANT.into(),
        name: name.into(),
        account_parameters: [(
            ANY.to_string(),
            SharingParam {
                strategy: strategy.into(),
                rating_subject: String::new(),
            },
        )]
        .into_iter()
        .collect(),
        member_ids: StringMap::from_items(members.iter().copied()),
    };
    engine.tariff.set_shared_group(&sg, None).await.unwrap();
}

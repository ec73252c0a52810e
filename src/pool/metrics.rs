use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

lazy_static! {
    pub static ref POOL_LOOKUPS: IntCounterVec = register_int_counter_vec!(
        "connpool_lookups_total",
        "Connection lookups by outcome (hit, miss, timeout)",
        &["outcome"]
    )
    .expect("register connpool_lookups_total counter vec");
    pub static ref DIALS: IntCounterVec = register_int_counter_vec!(
        "connpool_dials_total",
        "Dial attempts by result",
        &["result"]
    )
    .expect("register connpool_dials_total counter vec");
    pub static ref FAST_FAILS: IntCounter = register_int_counter!(
        "connpool_dial_fast_fails_total",
        "Dials short-circuited with the cached error while the endpoint is failing"
    )
    .expect("register connpool_dial_fast_fails_total counter");
    pub static ref STALE_EVICTIONS: IntCounter = register_int_counter!(
        "connpool_stale_evictions_total",
        "Connections closed for exceeding the idle or age limit"
    )
    .expect("register connpool_stale_evictions_total counter");
}

#[derive(Debug, Clone, Copy)]
pub struct PoolMetrics;

impl PoolMetrics {
    #[inline]
    pub fn record_hit() {
        POOL_LOOKUPS.with_label_values(&["hit"]).inc();
    }

    #[inline]
    pub fn record_miss() {
        POOL_LOOKUPS.with_label_values(&["miss"]).inc();
    }

    #[inline]
    pub fn record_timeout() {
        POOL_LOOKUPS.with_label_values(&["timeout"]).inc();
    }

    #[inline]
    pub fn record_dial(ok: bool) {
        let result = if ok { "ok" } else { "error" };
        DIALS.with_label_values(&[result]).inc();
    }

    #[inline]
    pub fn record_fast_fail() {
        FAST_FAILS.inc();
    }

    #[inline]
    pub fn record_stale(n: u64) {
        STALE_EVICTIONS.inc_by(n);
    }
}

#[inline]
pub fn init() {
    lazy_static::initialize(&POOL_LOOKUPS);
    lazy_static::initialize(&DIALS);
    lazy_static::initialize(&FAST_FAILS);
    lazy_static::initialize(&STALE_EVICTIONS);
}

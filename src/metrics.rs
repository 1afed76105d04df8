use std::sync::OnceLock;

use http::StatusCode;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn requests_status_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("ocelot_requests_status_total", "Responses by status code"),
            &["code"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn tier_hits_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("ocelot_block_hits_total", "Block reads served per tier"),
            &["tier"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn block_misses_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter =
            IntCounter::new("ocelot_block_misses_total", "Block reads absent from every tier").unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn hydrations_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new("ocelot_hydrations_total", "Origin block fetches").unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn hydration_errors_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter =
            IntCounter::new("ocelot_hydration_errors_total", "Failed origin block fetches").unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn evictions_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("ocelot_evicted_blocks_total", "Blocks evicted per tier"),
            &["tier"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn evicted_bytes_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("ocelot_evicted_bytes_total", "Bytes evicted per tier"),
            &["tier"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn not_cacheable_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter =
            IntCounter::new("ocelot_not_cacheable_total", "Lookups resolved as not cacheable").unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

pub fn record_status(status: StatusCode) {
    requests_status_total()
        .with_label_values(&[status.as_str()])
        .inc();
}

pub fn record_tier_hit(tier: &str) {
    tier_hits_total().with_label_values(&[tier]).inc();
}

pub fn record_block_miss() {
    block_misses_total().inc();
}

pub fn record_hydration() {
    hydrations_total().inc();
}

pub fn record_hydration_error() {
    hydration_errors_total().inc();
}

pub fn record_eviction(tier: &str, bytes: u64) {
    evictions_total().with_label_values(&[tier]).inc();
    evicted_bytes_total().with_label_values(&[tier]).inc_by(bytes);
}

pub fn record_not_cacheable() {
    not_cacheable_total().inc();
}

pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&registry().gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

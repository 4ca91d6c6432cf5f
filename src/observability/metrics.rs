//! Metric recording for the session layer
//!
//! Counters and histograms are recorded through the `metrics` facade; the
//! host application decides which exporter (if any) to install. Cardinality
//! stays bounded by construction: cache names and event kinds are static
//! strings, provider names come from a three-variant enum, and identifiers
//! (user ids, session ids) are never used as labels.

use std::time::Duration;

use metrics::{counter, histogram};

/// Record one cache event (hit, miss, expired, set, delete, evict,
/// invalidate) for the named cache.
pub fn record_cache_event(cache: &'static str, event: &'static str) {
    counter!("session_cache_events_total", "cache" => cache, "event" => event).increment(1);
}

/// Record an identity resolution and where its answer came from.
pub fn record_resolution(source: &'static str, duration: Duration) {
    counter!("session_resolutions_total", "source" => source).increment(1);
    histogram!("session_resolution_duration_seconds", "source" => source)
        .record(duration.as_secs_f64());
}

/// Record a credential/client lookup outcome for a provider.
pub fn record_credential_lookup(provider: &'static str, outcome: &'static str, duration: Duration) {
    counter!(
        "credential_lookups_total",
        "provider" => provider,
        "outcome" => outcome
    )
    .increment(1);
    histogram!("credential_lookup_duration_seconds", "provider" => provider)
        .record(duration.as_secs_f64());
}

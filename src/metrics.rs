/// Metrics Module - Prometheus Instrumentation
///
/// Engine-level counters and gauges behind a process-wide registry, with a
/// text-encoder dump for scraping or diagnostics.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Blocks committed to the index (apply side)
    pub static ref BLOCKS_INDEXED: IntCounter = IntCounter::new(
        "armorydb_blocks_indexed_total",
        "Blocks committed to the index"
    ).unwrap();

    /// Blocks undone during reorgs
    pub static ref BLOCKS_UNDONE: IntCounter = IntCounter::new(
        "armorydb_blocks_undone_total",
        "Blocks rolled back during reorgs"
    ).unwrap();

    /// Chain reorganizations observed
    pub static ref REORG_COUNT: IntCounter = IntCounter::new(
        "armorydb_reorgs_total",
        "Chain reorganizations committed"
    ).unwrap();

    /// Zero-confirmation transactions admitted
    pub static ref ZC_ADMITTED: IntCounter = IntCounter::new(
        "armorydb_zc_admitted_total",
        "Zero-confirmation transactions admitted"
    ).unwrap();

    /// Zero-confirmation transactions evicted (double-spend, reorg, expiry)
    pub static ref ZC_EVICTED: IntCounter = IntCounter::new(
        "armorydb_zc_evicted_total",
        "Zero-confirmation transactions evicted"
    ).unwrap();

    /// Connected client sessions
    pub static ref SESSIONS_CONNECTED: IntGauge = IntGauge::new(
        "armorydb_sessions_connected",
        "Connected client sessions"
    ).unwrap();

    /// Current main-branch top height
    pub static ref TOP_HEIGHT: IntGauge = IntGauge::new(
        "armorydb_top_height",
        "Main-branch top height"
    ).unwrap();

    /// Bytes sent through the encrypted transport
    pub static ref TRANSPORT_BYTES_OUT: IntCounter = IntCounter::new(
        "armorydb_transport_bytes_out_total",
        "Bytes written to client connections"
    ).unwrap();

    /// Bytes received through the encrypted transport
    pub static ref TRANSPORT_BYTES_IN: IntCounter = IntCounter::new(
        "armorydb_transport_bytes_in_total",
        "Bytes read from client connections"
    ).unwrap();
}

/// Register all metrics with the global registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(BLOCKS_INDEXED.clone()),
        Box::new(BLOCKS_UNDONE.clone()),
        Box::new(REORG_COUNT.clone()),
        Box::new(ZC_ADMITTED.clone()),
        Box::new(ZC_EVICTED.clone()),
        Box::new(SESSIONS_CONNECTED.clone()),
        Box::new(TOP_HEIGHT.clone()),
        Box::new(TRANSPORT_BYTES_OUT.clone()),
        Box::new(TRANSPORT_BYTES_IN.clone()),
    ];
    for collector in collectors {
        // Double registration only happens in tests; ignore it.
        let _ = REGISTRY.register(collector);
    }
}

/// Render the registry in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

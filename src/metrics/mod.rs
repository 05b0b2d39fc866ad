
use lazy_static::lazy_static;
use prometheus::IntGauge;
use prometheus::Registry;

lazy_static! {
    /// Total registered watchers across all streams.
    pub static ref WATCHER_GAUGE: IntGauge =
        IntGauge::new("watcher_total", "Total number of registered watchers")
            .expect("metric can not be created");
    /// Watchers currently lagging behind the store.
    pub static ref SLOW_WATCHER_GAUGE: IntGauge =
        IntGauge::new("slow_watcher_total", "Number of unsynced (lagging) watchers")
            .expect("metric can not be created");
    /// Open watch streams.
    pub static ref WATCH_STREAM_GAUGE: IntGauge =
        IntGauge::new("watch_stream_total", "Number of open watch streams")
            .expect("metric can not be created");
    /// Events enqueued on watch channels and not yet consumed.
    pub static ref PENDING_EVENTS_GAUGE: IntGauge =
        IntGauge::new("pending_events_total", "Number of events enqueued for delivery")
            .expect("metric can not be created");
    pub static ref CUSTOM_REGISTRY: Registry =
        Registry::new_custom(Some("watchkv".to_string()), None).unwrap();
}

pub fn register_custom_metrics(registry: &Registry) {
    registry
        .register(Box::new(WATCHER_GAUGE.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(SLOW_WATCHER_GAUGE.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(WATCH_STREAM_GAUGE.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(PENDING_EVENTS_GAUGE.clone()))
        .expect("collector can be registered");
}

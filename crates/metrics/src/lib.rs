use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Thread-safe counters for one connector instance.
///
/// Written by the stream tasks, read by the health reporter and at shutdown.
#[derive(Debug)]
pub struct ConnectorMetrics {
    // Transport
    messages_received: AtomicU64,
    parse_errors: AtomicU64,
    websocket_errors: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnect_successes: AtomicU64,
    connection_failures: AtomicU64,

    // Book synchronization
    depth_batches_received: AtomicU64,
    depth_batches_applied: AtomicU64,
    depth_batches_dropped: AtomicU64,
    snapshots_fetched: AtomicU64,
    snapshot_failures: AtomicU64,
    resyncs: AtomicU64,
    book_live: AtomicBool,

    // Trades and orders
    trades_received: AtomicU64,
    trade_matches: AtomicU64,
    status_changes: AtomicU64,

    inner: RwLock<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    start_time: Instant,
    last_message_time: Option<Instant>,
    last_error_time: Option<Instant>,
    last_resync_time: Option<Instant>,
}

impl Default for ConnectorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl ConnectorMetrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            websocket_errors: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            reconnect_successes: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            depth_batches_received: AtomicU64::new(0),
            depth_batches_applied: AtomicU64::new(0),
            depth_batches_dropped: AtomicU64::new(0),
            snapshots_fetched: AtomicU64::new(0),
            snapshot_failures: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
            book_live: AtomicBool::new(false),
            trades_received: AtomicU64::new(0),
            trade_matches: AtomicU64::new(0),
            status_changes: AtomicU64::new(0),
            inner: RwLock::new(MetricsInner {
                start_time: Instant::now(),
                last_message_time: None,
                last_error_time: None,
                last_resync_time: None,
            }),
        }
    }

    // --- Transport ---

    pub fn inc_messages_received(&self) {
        bump(&self.messages_received);
        self.inner.write().last_message_time = Some(Instant::now());
    }

    pub fn inc_parse_errors(&self) {
        bump(&self.parse_errors);
        self.inner.write().last_error_time = Some(Instant::now());
    }

    pub fn inc_websocket_errors(&self) {
        bump(&self.websocket_errors);
        self.inner.write().last_error_time = Some(Instant::now());
    }

    pub fn inc_reconnect_attempts(&self) {
        bump(&self.reconnect_attempts);
    }

    pub fn inc_reconnect_successes(&self) {
        bump(&self.reconnect_successes);
    }

    pub fn inc_connection_failures(&self) {
        bump(&self.connection_failures);
        self.inner.write().last_error_time = Some(Instant::now());
    }

    // --- Book synchronization ---

    pub fn inc_depth_batches_received(&self) {
        bump(&self.depth_batches_received);
    }

    pub fn inc_depth_batches_applied(&self) {
        bump(&self.depth_batches_applied);
    }

    /// Stale or rejected batches.
    pub fn inc_depth_batches_dropped(&self) {
        bump(&self.depth_batches_dropped);
    }

    pub fn inc_snapshots_fetched(&self) {
        bump(&self.snapshots_fetched);
    }

    pub fn inc_snapshot_failures(&self) {
        bump(&self.snapshot_failures);
    }

    /// The book fell back to syncing.
    pub fn inc_resyncs(&self) {
        bump(&self.resyncs);
        self.book_live.store(false, Ordering::Relaxed);
        self.inner.write().last_resync_time = Some(Instant::now());
    }

    pub fn set_book_live(&self, live: bool) {
        self.book_live.store(live, Ordering::Relaxed);
    }

    // --- Trades and orders ---

    pub fn inc_trades_received(&self) {
        bump(&self.trades_received);
    }

    pub fn inc_trade_matches(&self) {
        bump(&self.trade_matches);
    }

    pub fn inc_status_changes(&self) {
        bump(&self.status_changes);
    }

    // --- Getters ---

    pub fn messages_received(&self) -> u64 {
        read(&self.messages_received)
    }

    pub fn parse_errors(&self) -> u64 {
        read(&self.parse_errors)
    }

    pub fn websocket_errors(&self) -> u64 {
        read(&self.websocket_errors)
    }

    pub fn reconnect_attempts(&self) -> u64 {
        read(&self.reconnect_attempts)
    }

    pub fn depth_batches_applied(&self) -> u64 {
        read(&self.depth_batches_applied)
    }

    pub fn resyncs(&self) -> u64 {
        read(&self.resyncs)
    }

    pub fn is_book_live(&self) -> bool {
        self.book_live.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> f64 {
        self.inner.read().start_time.elapsed().as_secs_f64()
    }

    pub fn secs_since_last_message(&self) -> Option<f64> {
        self.inner
            .read()
            .last_message_time
            .map(|t| t.elapsed().as_secs_f64())
    }

    pub fn secs_since_last_error(&self) -> Option<f64> {
        self.inner
            .read()
            .last_error_time
            .map(|t| t.elapsed().as_secs_f64())
    }

    pub fn secs_since_last_resync(&self) -> Option<f64> {
        self.inner
            .read()
            .last_resync_time
            .map(|t| t.elapsed().as_secs_f64())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received(),
            parse_errors: self.parse_errors(),
            websocket_errors: self.websocket_errors(),
            reconnect_attempts: self.reconnect_attempts(),
            reconnect_successes: read(&self.reconnect_successes),
            connection_failures: read(&self.connection_failures),
            depth_batches_received: read(&self.depth_batches_received),
            depth_batches_applied: self.depth_batches_applied(),
            depth_batches_dropped: read(&self.depth_batches_dropped),
            snapshots_fetched: read(&self.snapshots_fetched),
            snapshot_failures: read(&self.snapshot_failures),
            resyncs: self.resyncs(),
            book_live: self.is_book_live(),
            trades_received: read(&self.trades_received),
            trade_matches: read(&self.trade_matches),
            status_changes: read(&self.status_changes),
            uptime_secs: self.uptime_secs(),
            secs_since_last_message: self.secs_since_last_message(),
            secs_since_last_error: self.secs_since_last_error(),
        }
    }
}

/// A point-in-time copy of every counter.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub parse_errors: u64,
    pub websocket_errors: u64,
    pub reconnect_attempts: u64,
    pub reconnect_successes: u64,
    pub connection_failures: u64,
    pub depth_batches_received: u64,
    pub depth_batches_applied: u64,
    pub depth_batches_dropped: u64,
    pub snapshots_fetched: u64,
    pub snapshot_failures: u64,
    pub resyncs: u64,
    pub book_live: bool,
    pub trades_received: u64,
    pub trade_matches: u64,
    pub status_changes: u64,
    pub uptime_secs: f64,
    pub secs_since_last_message: Option<f64>,
    pub secs_since_last_error: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Data flowing and the book is live.
    Healthy,
    /// Data is stale or the book is resynchronizing.
    Degraded,
    /// No data for an extended period.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Degraded => write!(f, "DEGRADED"),
            HealthStatus::Unhealthy => write!(f, "UNHEALTHY"),
        }
    }
}

impl MetricsSnapshot {
    const STALE_THRESHOLD_SECS: f64 = 30.0;
    const UNHEALTHY_THRESHOLD_SECS: f64 = 60.0;

    pub fn health_status(&self) -> HealthStatus {
        // Before the first message, judge by how long we have been up.
        let silence = self.secs_since_last_message.unwrap_or(self.uptime_secs);

        if silence > Self::UNHEALTHY_THRESHOLD_SECS {
            HealthStatus::Unhealthy
        } else if silence > Self::STALE_THRESHOLD_SECS {
            HealthStatus::Degraded
        } else if !self.book_live && self.secs_since_last_message.is_some() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Connector Metrics ===")?;
        writeln!(f, "Uptime:              {:.1}s", self.uptime_secs)?;
        writeln!(f, "Messages received:   {}", self.messages_received)?;
        writeln!(f, "Trades received:     {}", self.trades_received)?;
        writeln!(
            f,
            "Depth batches:       {} received, {} applied, {} dropped",
            self.depth_batches_received, self.depth_batches_applied, self.depth_batches_dropped
        )?;
        writeln!(
            f,
            "Snapshots:           {} fetched, {} failed",
            self.snapshots_fetched, self.snapshot_failures
        )?;
        writeln!(f, "Resyncs:             {}", self.resyncs)?;
        writeln!(f, "Book live:           {}", self.book_live)?;
        writeln!(f, "Trade matches:       {}", self.trade_matches)?;
        writeln!(f, "Status changes:      {}", self.status_changes)?;
        writeln!(f, "Parse errors:        {}", self.parse_errors)?;
        writeln!(f, "WebSocket errors:    {}", self.websocket_errors)?;
        writeln!(
            f,
            "Reconnects:          {} attempted, {} succeeded, {} failed connects",
            self.reconnect_attempts, self.reconnect_successes, self.connection_failures
        )?;
        if let Some(secs) = self.secs_since_last_message {
            writeln!(f, "Since last message:  {:.1}s", secs)?;
        }
        if let Some(secs) = self.secs_since_last_error {
            writeln!(f, "Since last error:    {:.1}s", secs)?;
        }
        Ok(())
    }
}

pub type SharedMetrics = Arc<ConnectorMetrics>;

pub fn create_metrics() -> SharedMetrics {
    Arc::new(ConnectorMetrics::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(secs_since_last_message: Option<f64>, uptime_secs: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            book_live: true,
            uptime_secs,
            secs_since_last_message,
            ..Default::default()
        }
    }

    #[test]
    fn test_counters() {
        let metrics = ConnectorMetrics::new();
        metrics.inc_messages_received();
        metrics.inc_messages_received();
        metrics.inc_depth_batches_applied();
        metrics.inc_parse_errors();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_received, 2);
        assert_eq!(snapshot.depth_batches_applied, 1);
        assert_eq!(snapshot.parse_errors, 1);
        assert!(metrics.secs_since_last_error().is_some());
    }

    #[test]
    fn test_resync_clears_live_flag() {
        let metrics = ConnectorMetrics::new();
        metrics.set_book_live(true);
        assert!(metrics.is_book_live());

        metrics.inc_resyncs();
        assert!(!metrics.is_book_live());
        assert_eq!(metrics.resyncs(), 1);
        assert!(metrics.secs_since_last_resync().is_some());
    }

    #[test]
    fn test_health_follows_message_silence() {
        assert_eq!(live(Some(5.0), 120.0).health_status(), HealthStatus::Healthy);
        assert_eq!(live(Some(30.0), 120.0).health_status(), HealthStatus::Healthy);
        assert_eq!(live(Some(45.0), 120.0).health_status(), HealthStatus::Degraded);
        assert_eq!(live(Some(60.0), 120.0).health_status(), HealthStatus::Degraded);
        assert_eq!(live(Some(90.0), 300.0).health_status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_health_during_startup() {
        assert_eq!(live(None, 10.0).health_status(), HealthStatus::Healthy);
        assert_eq!(live(None, 45.0).health_status(), HealthStatus::Degraded);
        assert_eq!(live(None, 120.0).health_status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_syncing_book_is_degraded() {
        let snapshot = MetricsSnapshot {
            book_live: false,
            ..live(Some(1.0), 120.0)
        };
        assert_eq!(snapshot.health_status(), HealthStatus::Degraded);
    }
}

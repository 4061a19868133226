//! Reconciles a REST snapshot with a live delta stream.
//!
//! The snapshot fetch and the stream start independently, so deltas that
//! arrive before the snapshot are buffered and replayed on top of it:
//!
//! 1. `begin()` enters `Syncing`, clears the book and hands back a
//!    [`SnapshotRequest`]. The caller fetches the snapshot off the ingestion
//!    path while batches keep arriving and get buffered.
//! 2. `on_snapshot()` replaces the book, drops buffered batches already
//!    covered by the snapshot (`final_sequence <= S`), replays the rest in
//!    ascending order and goes `Live`.
//! 3. In `Live`, stale batches are dropped, contiguous ones are applied and a
//!    gap sends the synchronizer back to `Syncing` with a new request.
//!
//! Requests carry a generation number. A snapshot answering an abandoned
//! request is ignored so it can never be spliced against the wrong buffer.

use std::collections::VecDeque;

use model::{BookSnapshot, BookUpdate, DeltaBatch, Exchange, InstrumentTraits, Snapshot};
use tracing::{debug, info, warn, Span};

use crate::book::OrderBook;

/// Default number of batches buffered while waiting for a snapshot.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// Default number of consecutive malformed messages tolerated before a resync.
pub const DEFAULT_MAX_PROTOCOL_VIOLATIONS: u32 = 5;

/// How the venue numbers its updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencePolicy {
    /// Each batch must start at or before `last + 1 + gap_tolerance`.
    Contiguous { gap_tolerance: u64 },
    /// Any batch ending after `last` is accepted.
    Increasing,
}

#[derive(Debug, Clone, Copy)]
pub struct SynchronizerConfig {
    pub policy: SequencePolicy,
    pub buffer_capacity: usize,
    pub max_protocol_violations: u32,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            policy: SequencePolicy::Contiguous { gap_tolerance: 0 },
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_protocol_violations: DEFAULT_MAX_PROTOCOL_VIOLATIONS,
        }
    }
}

/// Ask the caller to fetch a snapshot for `generation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub generation: u64,
}

/// Result of feeding one batch to the synchronizer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Applied to a live book.
    Applied(BookUpdate),
    /// Held until the snapshot arrives.
    Buffered,
    /// Already covered by the book; nothing changed.
    Stale,
    /// Malformed; logged and dropped.
    Rejected,
    /// Local state was discarded; a new snapshot is needed.
    Resync(SnapshotRequest),
}

/// Result of offering a snapshot to the synchronizer.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotOutcome {
    /// The book is live; carries the full book after buffered batches were replayed.
    Synchronized(BookSnapshot),
    /// Answer to an abandoned request, or the book is already live.
    Ignored,
    /// The snapshot did not splice with the buffer; a new one is needed.
    Resync(SnapshotRequest),
}

#[derive(Debug)]
enum SyncState {
    Syncing { buffer: VecDeque<DeltaBatch> },
    Live { last_sequence: u64 },
}

pub struct BookSynchronizer {
    book: OrderBook,
    config: SynchronizerConfig,
    state: SyncState,
    generation: u64,
    violations: u32,
    span: Span,
}

impl BookSynchronizer {
    /// The synchronizer starts in `Syncing`; call [`begin`](Self::begin) to
    /// obtain the first snapshot request.
    pub fn new(
        exchange: Exchange,
        symbol: impl Into<String>,
        traits: InstrumentTraits,
        config: SynchronizerConfig,
        span: Span,
    ) -> Self {
        Self {
            book: OrderBook::new(exchange, symbol, traits),
            config,
            state: SyncState::Syncing {
                buffer: VecDeque::new(),
            },
            generation: 0,
            violations: 0,
            span,
        }
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, SyncState::Live { .. })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Last applied sequence while live.
    pub fn last_sequence(&self) -> Option<u64> {
        match self.state {
            SyncState::Live { last_sequence } => Some(last_sequence),
            SyncState::Syncing { .. } => None,
        }
    }

    /// Number of batches waiting for a snapshot.
    pub fn buffered(&self) -> usize {
        match &self.state {
            SyncState::Syncing { buffer } => buffer.len(),
            SyncState::Live { .. } => 0,
        }
    }

    /// Starts (or restarts) synchronization from scratch.
    pub fn begin(&mut self) -> SnapshotRequest {
        let span = self.span.clone();
        let _enter = span.enter();
        info!(symbol = %self.book.symbol(), "starting book synchronization");
        self.reset(None)
    }

    pub fn on_batch(&mut self, batch: DeltaBatch) -> SyncOutcome {
        let span = self.span.clone();
        let _enter = span.enter();

        if let Err(reason) = check_batch(&batch, &self.book) {
            return self.on_protocol_violation(&reason);
        }

        match &mut self.state {
            SyncState::Syncing { buffer } => {
                if buffer.len() >= self.config.buffer_capacity {
                    warn!(
                        symbol = %self.book.symbol(),
                        capacity = self.config.buffer_capacity,
                        "sync buffer overflow, restarting synchronization"
                    );
                    return SyncOutcome::Resync(self.reset(Some(batch)));
                }
                buffer.push_back(batch);
                SyncOutcome::Buffered
            }
            SyncState::Live { last_sequence } => {
                let last = *last_sequence;
                if batch.final_sequence <= last {
                    debug!(
                        final_sequence = batch.final_sequence,
                        last_sequence = last,
                        "dropping stale batch"
                    );
                    return SyncOutcome::Stale;
                }
                if !self.follows(last, &batch) {
                    warn!(
                        symbol = %self.book.symbol(),
                        expected = last + 1,
                        got_first = batch.first_sequence,
                        got_final = batch.final_sequence,
                        "sequence gap detected, resyncing"
                    );
                    return SyncOutcome::Resync(self.reset(Some(batch)));
                }
                match self.apply_batch(&batch) {
                    Ok(()) => {
                        self.state = SyncState::Live {
                            last_sequence: batch.final_sequence,
                        };
                        self.violations = 0;
                        SyncOutcome::Applied(self.update_for(batch))
                    }
                    Err(reason) => {
                        // A partially applied batch leaves the book unusable.
                        warn!(symbol = %self.book.symbol(), reason = %reason, "batch failed mid-apply, resyncing");
                        SyncOutcome::Resync(self.reset(None))
                    }
                }
            }
        }
    }

    pub fn on_snapshot(&mut self, generation: u64, snapshot: Snapshot) -> SnapshotOutcome {
        let span = self.span.clone();
        let _enter = span.enter();

        if generation != self.generation || self.is_live() {
            debug!(
                generation,
                current = self.generation,
                "ignoring snapshot for abandoned request"
            );
            return SnapshotOutcome::Ignored;
        }

        if let Err(e) = self.book.apply_snapshot(&snapshot) {
            warn!(error = %e, sequence = snapshot.sequence, "rejected snapshot, resyncing");
            return SnapshotOutcome::Resync(self.reset(None));
        }

        let buffer = match std::mem::replace(
            &mut self.state,
            SyncState::Live {
                last_sequence: snapshot.sequence,
            },
        ) {
            SyncState::Syncing { buffer } => buffer,
            SyncState::Live { .. } => VecDeque::new(),
        };

        let buffered = buffer.len();
        let mut pending: Vec<DeltaBatch> = buffer
            .into_iter()
            .filter(|b| b.final_sequence > snapshot.sequence)
            .collect();
        pending.sort_by_key(|b| (b.first_sequence, b.final_sequence));
        let stale = buffered - pending.len();

        let mut last = snapshot.sequence;
        let mut replayed = 0usize;
        for batch in pending {
            if batch.final_sequence <= last {
                continue;
            }
            if !self.follows(last, &batch) {
                warn!(
                    symbol = %self.book.symbol(),
                    snapshot_sequence = snapshot.sequence,
                    expected = last + 1,
                    got_first = batch.first_sequence,
                    "buffered batches do not splice onto snapshot, resyncing"
                );
                return SnapshotOutcome::Resync(self.reset(None));
            }
            if let Err(reason) = self.apply_batch(&batch) {
                warn!(reason = %reason, "buffered batch failed mid-apply, resyncing");
                return SnapshotOutcome::Resync(self.reset(None));
            }
            last = batch.final_sequence;
            replayed += 1;
        }

        self.state = SyncState::Live {
            last_sequence: last,
        };
        self.violations = 0;

        info!(
            symbol = %self.book.symbol(),
            snapshot_sequence = snapshot.sequence,
            last_sequence = last,
            replayed,
            stale,
            "book synchronized"
        );
        SnapshotOutcome::Synchronized(self.book.snapshot())
    }

    /// Records a malformed message. Repeated violations force a resync.
    pub fn on_protocol_violation(&mut self, reason: &str) -> SyncOutcome {
        self.violations += 1;
        warn!(
            symbol = %self.book.symbol(),
            reason = %reason,
            consecutive = self.violations,
            "dropping malformed book message"
        );
        if self.violations >= self.config.max_protocol_violations {
            warn!(
                symbol = %self.book.symbol(),
                violations = self.violations,
                "too many consecutive protocol violations, resyncing"
            );
            return SyncOutcome::Resync(self.reset(None));
        }
        SyncOutcome::Rejected
    }

    fn follows(&self, last: u64, batch: &DeltaBatch) -> bool {
        match self.config.policy {
            SequencePolicy::Contiguous { gap_tolerance } => {
                batch.first_sequence <= last.saturating_add(1).saturating_add(gap_tolerance)
            }
            SequencePolicy::Increasing => true,
        }
    }

    fn apply_batch(&mut self, batch: &DeltaBatch) -> Result<(), String> {
        for delta in &batch.deltas {
            self.book.apply(delta).map_err(|e| e.to_string())?;
        }
        self.book.advance_sequence(batch.final_sequence);
        Ok(())
    }

    fn update_for(&self, batch: DeltaBatch) -> BookUpdate {
        BookUpdate {
            exchange: batch.exchange,
            symbol: batch.symbol,
            first_sequence: batch.first_sequence,
            final_sequence: batch.final_sequence,
            deltas: batch.deltas,
            best_bid: self.book.best_bid(),
            best_ask: self.book.best_ask(),
            timestamp_ms: batch.timestamp_ms,
        }
    }

    /// Discards local state and returns a request for a new generation.
    /// `seed` is kept as the first buffered batch.
    fn reset(&mut self, seed: Option<DeltaBatch>) -> SnapshotRequest {
        self.generation += 1;
        self.violations = 0;
        self.book.clear();
        self.state = SyncState::Syncing {
            buffer: seed.into_iter().collect(),
        };
        SnapshotRequest {
            generation: self.generation,
        }
    }
}

/// Structural checks that do not depend on book state.
fn check_batch(batch: &DeltaBatch, book: &OrderBook) -> Result<(), String> {
    if batch.final_sequence < batch.first_sequence {
        return Err(format!(
            "final sequence {} precedes first sequence {}",
            batch.final_sequence, batch.first_sequence
        ));
    }
    for delta in &batch.deltas {
        if delta.sequence < batch.first_sequence || delta.sequence > batch.final_sequence {
            return Err(format!(
                "delta sequence {} outside batch range {}..={}",
                delta.sequence, batch.first_sequence, batch.final_sequence
            ));
        }
        book.validate(delta).map_err(|e| e.to_string())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{BookLevel, Delta, Side};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn synchronizer(policy: SequencePolicy) -> BookSynchronizer {
        BookSynchronizer::new(
            Exchange::Binance,
            "BTCUSDT",
            InstrumentTraits::new(dec!(0.01), dec!(0.0001)),
            SynchronizerConfig {
                policy,
                buffer_capacity: 4,
                max_protocol_violations: 3,
            },
            Span::none(),
        )
    }

    fn contiguous() -> BookSynchronizer {
        synchronizer(SequencePolicy::Contiguous { gap_tolerance: 0 })
    }

    fn batch(first: u64, last: u64, deltas: Vec<Delta>) -> DeltaBatch {
        DeltaBatch {
            exchange: Exchange::Binance,
            symbol: "BTCUSDT".into(),
            first_sequence: first,
            final_sequence: last,
            deltas,
            timestamp_ms: 0,
        }
    }

    fn bid(first: u64, last: u64, price: Decimal, size: Decimal) -> DeltaBatch {
        batch(first, last, vec![Delta::assign(last, Side::Bid, price, size)])
    }

    fn snapshot_500() -> Snapshot {
        Snapshot::from_levels(500, &[(dec!(100), dec!(2.0))], &[(dec!(101), dec!(1.0))])
    }

    fn live_at_500(policy: SequencePolicy) -> BookSynchronizer {
        let mut sync = synchronizer(policy);
        let request = sync.begin();
        assert!(matches!(
            sync.on_snapshot(request.generation, snapshot_500()),
            SnapshotOutcome::Synchronized(_)
        ));
        sync
    }

    #[test]
    fn test_walkthrough_decrease_increase_and_late_delta() {
        let mut sync = live_at_500(SequencePolicy::Increasing);

        let out = sync.on_batch(DeltaBatch::single(
            Exchange::Binance,
            "BTCUSDT",
            Delta::decrease(501, Side::Bid, dec!(100), dec!(0.5)),
            0,
        ));
        assert!(matches!(out, SyncOutcome::Applied(_)));
        assert_eq!(sync.book().level_size(Side::Bid, dec!(100)), Some(dec!(1.5)));

        let out = sync.on_batch(DeltaBatch::single(
            Exchange::Binance,
            "BTCUSDT",
            Delta::increase(502, Side::Bid, dec!(99), dec!(1.0)),
            0,
        ));
        match out {
            SyncOutcome::Applied(update) => {
                assert_eq!(update.final_sequence, 502);
                assert_eq!(update.best_bid, Some(BookLevel::new(dec!(100), dec!(1.5))));
            }
            other => panic!("expected Applied, got {:?}", other),
        }
        assert_eq!(sync.book().level_size(Side::Bid, dec!(99)), Some(dec!(1)));

        let before = sync.book().snapshot();
        let out = sync.on_batch(DeltaBatch::single(
            Exchange::Binance,
            "BTCUSDT",
            Delta::assign(499, Side::Bid, dec!(100), dec!(9)),
            0,
        ));
        assert_eq!(out, SyncOutcome::Stale);
        assert_eq!(sync.book().snapshot(), before);
        assert_eq!(sync.last_sequence(), Some(502));
    }

    #[test]
    fn test_batches_buffered_until_snapshot() {
        let mut sync = contiguous();
        let request = sync.begin();

        assert_eq!(sync.on_batch(bid(495, 498, dec!(90), dec!(1))), SyncOutcome::Buffered);
        assert_eq!(sync.on_batch(bid(499, 503, dec!(95), dec!(1))), SyncOutcome::Buffered);
        assert_eq!(sync.on_batch(bid(504, 506, dec!(96), dec!(1))), SyncOutcome::Buffered);
        assert!(!sync.is_live());
        assert!(!sync.book().is_initialized());

        match sync.on_snapshot(request.generation, snapshot_500()) {
            SnapshotOutcome::Synchronized(view) => {
                assert_eq!(view.sequence, 506);
                let prices: Vec<_> = view.bids.iter().map(|l| l.price).collect();
                // 90 was covered by the snapshot and dropped.
                assert_eq!(prices, vec![dec!(100), dec!(96), dec!(95)]);
            }
            other => panic!("expected Synchronized, got {:?}", other),
        }
        assert_eq!(sync.last_sequence(), Some(506));
    }

    #[test]
    fn test_buffer_replayed_in_sequence_order() {
        let mut sync = contiguous();
        let request = sync.begin();

        sync.on_batch(bid(503, 504, dec!(100), dec!(7)));
        sync.on_batch(bid(501, 502, dec!(100), dec!(3)));

        sync.on_snapshot(request.generation, snapshot_500());
        assert_eq!(sync.book().level_size(Side::Bid, dec!(100)), Some(dec!(7)));
    }

    #[test]
    fn test_snapshot_too_old_for_buffer_resyncs() {
        let mut sync = contiguous();
        let request = sync.begin();
        sync.on_batch(bid(510, 512, dec!(100), dec!(1)));

        match sync.on_snapshot(request.generation, snapshot_500()) {
            SnapshotOutcome::Resync(next) => assert_eq!(next.generation, request.generation + 1),
            other => panic!("expected Resync, got {:?}", other),
        }
        assert!(!sync.is_live());
        assert!(!sync.book().is_initialized());
    }

    #[test]
    fn test_stale_generation_snapshot_ignored() {
        let mut sync = contiguous();
        let first = sync.begin();
        let second = sync.begin();
        assert_ne!(first, second);

        assert_eq!(
            sync.on_snapshot(first.generation, snapshot_500()),
            SnapshotOutcome::Ignored
        );
        assert!(!sync.is_live());
        assert!(matches!(
            sync.on_snapshot(second.generation, snapshot_500()),
            SnapshotOutcome::Synchronized(_)
        ));
        // A duplicate answer once live is ignored too.
        assert_eq!(
            sync.on_snapshot(second.generation, snapshot_500()),
            SnapshotOutcome::Ignored
        );
    }

    #[test]
    fn test_gap_while_live_resyncs() {
        let mut sync = live_at_500(SequencePolicy::Contiguous { gap_tolerance: 0 });
        assert!(matches!(
            sync.on_batch(bid(501, 501, dec!(100), dec!(1))),
            SyncOutcome::Applied(_)
        ));

        let generation = sync.generation();
        match sync.on_batch(bid(510, 511, dec!(100), dec!(3))) {
            SyncOutcome::Resync(request) => assert_eq!(request.generation, generation + 1),
            other => panic!("expected Resync, got {:?}", other),
        }
        assert!(!sync.is_live());
        assert!(!sync.book().is_initialized());
        // The batch that revealed the gap is kept for the next splice.
        assert_eq!(sync.buffered(), 1);
    }

    #[test]
    fn test_gap_tolerance() {
        let mut sync = live_at_500(SequencePolicy::Contiguous { gap_tolerance: 2 });
        assert!(matches!(
            sync.on_batch(bid(503, 503, dec!(100), dec!(1))),
            SyncOutcome::Applied(_)
        ));
        assert!(matches!(
            sync.on_batch(bid(507, 507, dec!(100), dec!(1))),
            SyncOutcome::Resync(_)
        ));
    }

    #[test]
    fn test_increasing_policy_accepts_jumps() {
        let mut sync = live_at_500(SequencePolicy::Increasing);
        assert!(matches!(
            sync.on_batch(bid(900, 900, dec!(100), dec!(1))),
            SyncOutcome::Applied(_)
        ));
        assert_eq!(sync.last_sequence(), Some(900));
    }

    #[test]
    fn test_buffer_overflow_resyncs() {
        let mut sync = contiguous();
        let request = sync.begin();
        for i in 0..4 {
            assert_eq!(
                sync.on_batch(bid(501 + i, 501 + i, dec!(100), dec!(1))),
                SyncOutcome::Buffered
            );
        }
        match sync.on_batch(bid(505, 505, dec!(100), dec!(1))) {
            SyncOutcome::Resync(next) => assert_eq!(next.generation, request.generation + 1),
            other => panic!("expected Resync, got {:?}", other),
        }
        assert_eq!(sync.buffered(), 1);
    }

    #[test]
    fn test_malformed_batch_dropped_then_escalates() {
        let mut sync = live_at_500(SequencePolicy::Contiguous { gap_tolerance: 0 });
        let inverted = batch(505, 501, vec![]);
        let negative = bid(501, 501, dec!(100), dec!(-1));

        assert_eq!(sync.on_batch(inverted.clone()), SyncOutcome::Rejected);
        assert_eq!(sync.on_batch(negative), SyncOutcome::Rejected);
        assert!(sync.is_live());
        assert_eq!(sync.book().level_size(Side::Bid, dec!(100)), Some(dec!(2)));

        assert!(matches!(sync.on_batch(inverted), SyncOutcome::Resync(_)));
        assert!(!sync.is_live());
    }

    #[test]
    fn test_good_batch_resets_violation_count() {
        let mut sync = live_at_500(SequencePolicy::Contiguous { gap_tolerance: 0 });
        for seq in 501..510 {
            assert_eq!(sync.on_protocol_violation("garbage"), SyncOutcome::Rejected);
            assert_eq!(sync.on_protocol_violation("garbage"), SyncOutcome::Rejected);
            assert!(matches!(
                sync.on_batch(bid(seq, seq, dec!(100), dec!(1))),
                SyncOutcome::Applied(_)
            ));
        }
    }

    #[test]
    fn test_oversized_price_dropped_while_live() {
        let mut sync = live_at_500(SequencePolicy::Contiguous { gap_tolerance: 0 });
        let before = sync.book().snapshot();

        let out = sync.on_batch(bid(501, 501, Decimal::MAX, dec!(1)));
        assert!(matches!(out, SyncOutcome::Rejected));
        assert!(sync.is_live());
        assert_eq!(sync.book().snapshot(), before);

        let out = sync.on_batch(bid(501, 501, dec!(100), dec!(3)));
        assert!(matches!(out, SyncOutcome::Applied(_)));
    }

    #[test]
    fn test_replay_matches_direct_application() {
        let deltas = vec![
            Delta::decrease(501, Side::Bid, dec!(100), dec!(0.5)),
            Delta::increase(502, Side::Ask, dec!(102), dec!(3)),
            Delta::assign(503, Side::Ask, dec!(101), dec!(0)),
            Delta::increase(504, Side::Bid, dec!(100), dec!(0.25)),
        ];

        // Deltas arrive before the snapshot.
        let mut buffered = contiguous();
        buffered.config.buffer_capacity = 16;
        let request = buffered.begin();
        for d in &deltas {
            buffered.on_batch(DeltaBatch::single(Exchange::Binance, "BTCUSDT", *d, 0));
        }
        buffered.on_snapshot(request.generation, snapshot_500());

        // Deltas arrive after the snapshot.
        let mut live = live_at_500(SequencePolicy::Contiguous { gap_tolerance: 0 });
        for d in &deltas {
            live.on_batch(DeltaBatch::single(Exchange::Binance, "BTCUSDT", *d, 0));
        }

        // Deltas applied straight to a book holding the snapshot.
        let mut direct = OrderBook::new(
            Exchange::Binance,
            "BTCUSDT",
            InstrumentTraits::new(dec!(0.01), dec!(0.0001)),
        );
        direct.apply_snapshot(&snapshot_500()).unwrap();
        for d in &deltas {
            direct.apply(d).unwrap();
        }

        assert_eq!(buffered.book().snapshot(), direct.snapshot());
        assert_eq!(live.book().snapshot(), direct.snapshot());
    }
}

pub mod record;
pub mod store;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use prometheus::Counter;
use tracing::{debug, warn};

use self::record::{format_local_time, format_ref_time, TpsRecord};
use self::store::RecordStore;
use crate::chain::BlockData;
use crate::config::Consensus;
use crate::sink::report::ReportWriter;
use crate::sink::{Fanout, Sample};

const ONE_SECOND: Duration = Duration::from_secs(1);

/// Input to the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// A block read from the chain.
    Block(BlockData),
    /// A tick with no block, carrying the wall-clock time of the tick.
    Heartbeat(SystemTime),
}

/// Turns a stream of blocks and heartbeats into one TPS record per
/// block-time second.
///
/// The first observation fixes the epoch. Every later observation whose time
/// reaches the next one-second boundary emits a record carrying the counters
/// as they stood before that observation, then moves both boundaries forward
/// by one second. A long gap therefore produces a single record, and the
/// boundaries catch up one second per observation.
pub struct Aggregator {
    consensus: Consensus,
    first_block_time: Option<SystemTime>,
    /// Next reference-time boundary, in seconds since the epoch observation.
    ref_time_next: u64,
    /// Next block-time boundary.
    block_time_next: SystemTime,
    blocks: u64,
    transactions: u64,
    store: RecordStore,
    report: Option<ReportWriter>,
    sinks: Fanout,
    records_emitted: Option<Counter>,
}

impl Aggregator {
    pub fn new(consensus: Consensus, store: RecordStore) -> Self {
        Self {
            consensus,
            first_block_time: None,
            ref_time_next: 0,
            block_time_next: UNIX_EPOCH,
            blocks: 0,
            transactions: 0,
            store,
            report: None,
            sinks: Fanout::new(),
            records_emitted: None,
        }
    }

    /// Write every record to `report`.
    pub fn with_report(mut self, report: ReportWriter) -> Self {
        self.report = Some(report);
        self
    }

    /// Dispatch every record to `sinks`.
    pub fn with_sinks(mut self, sinks: Fanout) -> Self {
        self.sinks = sinks;
        self
    }

    /// Count emitted records in `counter`.
    pub fn with_records_counter(mut self, counter: Counter) -> Self {
        self.records_emitted = Some(counter);
        self
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Blocks observed so far.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Transactions observed so far.
    pub fn transactions(&self) -> u64 {
        self.transactions
    }

    /// Feed one observation. Returns the record it emitted, if any.
    ///
    /// An observation whose time cannot be represented as a calendar date is
    /// logged and dropped without touching any state.
    pub fn observe(&mut self, observation: Observation) -> Option<TpsRecord> {
        let Some((t, t_next)) = self.observation_time(&observation) else {
            warn!(?observation, "observation time out of range, dropping it");
            return None;
        };

        let tps = self.tps_at(t);

        if self.first_block_time.is_none() {
            self.first_block_time = Some(t);
            self.ref_time_next = 1;
            self.block_time_next = t_next;
        }

        let emitted = if t >= self.block_time_next {
            let boundary = self.block_time_next;
            // The boundary never passes t, so both succeed for any t
            // observation_time accepted.
            let (Some(local_time), Some(next_boundary)) =
                (format_local_time(boundary), boundary.checked_add(ONE_SECOND))
            else {
                warn!(?boundary, "record boundary out of range, dropping observation");
                return None;
            };

            let record = TpsRecord {
                local_time,
                ref_time: format_ref_time(self.ref_time_next),
                tps,
                transactions: self.transactions,
                blocks: self.blocks,
                timestamp: boundary,
            };
            self.emit(&record);

            self.ref_time_next += 1;
            self.block_time_next = next_boundary;

            Some(record)
        } else {
            None
        };

        if let Observation::Block(block) = observation {
            self.blocks += 1;
            self.transactions += block.txn_count as u64;
        }

        emitted
    }

    /// Time of an observation and the second after it, provided both have a
    /// calendar representation.
    fn observation_time(&self, observation: &Observation) -> Option<(SystemTime, SystemTime)> {
        let t = match observation {
            Observation::Block(block) => self.block_time(block)?,
            Observation::Heartbeat(now) => *now,
        };

        let end = t.checked_add(ONE_SECOND)?;
        format_local_time(t)?;
        format_local_time(end)?;
        Some((t, end))
    }

    /// Decodes the block timestamp for the configured consensus.
    fn block_time(&self, block: &BlockData) -> Option<SystemTime> {
        let offset = if self.consensus.nanosecond_timestamps() {
            Duration::from_nanos(block.timestamp)
        } else {
            Duration::from_secs(block.timestamp)
        };
        UNIX_EPOCH.checked_add(offset)
    }

    /// Cumulative average over whole elapsed seconds since the epoch.
    fn tps_at(&self, t: SystemTime) -> u32 {
        let Some(first) = self.first_block_time else {
            return 0;
        };

        let elapsed_secs = match t.duration_since(first) {
            Ok(elapsed) => (elapsed.as_millis() / 1000) as u64,
            Err(_) => return 0,
        };

        debug!(elapsed_secs, transactions = self.transactions, "computing tps");

        if elapsed_secs == 0 {
            return 0;
        }

        u32::try_from(self.transactions / elapsed_secs).unwrap_or(u32::MAX)
    }

    fn emit(&mut self, record: &TpsRecord) {
        debug!(%record, "emitting record");

        if let Some(report) = self.report.as_mut() {
            if let Err(e) = report.write(record) {
                warn!(error = %e, "writing to report failed");
            }
        }

        self.store.push(record.clone());

        if let Some(counter) = &self.records_emitted {
            counter.inc();
        }

        self.sinks.dispatch(Sample::from(record));
    }
}

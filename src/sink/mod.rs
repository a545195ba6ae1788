pub mod cloudwatch;
pub mod influxdb;
pub mod prometheus;
pub mod report;

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use ::prometheus::CounterVec;

use self::cloudwatch::CloudWatchSink;
use self::influxdb::InfluxDbSink;
use self::prometheus::PrometheusSink;
use crate::aggregator::record::TpsRecord;

/// Value pushed to every sink for one emitted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub timestamp: SystemTime,
    pub tps: u32,
    pub transactions: u64,
    pub blocks: u64,
}

impl From<&TpsRecord> for Sample {
    fn from(record: &TpsRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            tps: record.tps,
            transactions: record.transactions,
            blocks: record.blocks,
        }
    }
}

/// Sink dispatches samples to one metrics backend.
///
/// Enum dispatch keeps the per-sample push free of boxed futures.
pub enum Sink {
    CloudWatch(CloudWatchSink),
    Prometheus(Arc<PrometheusSink>),
    InfluxDb(InfluxDbSink),
}

impl Sink {
    /// Returns the sink name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::CloudWatch(s) => s.name(),
            Self::Prometheus(s) => s.name(),
            Self::InfluxDb(s) => s.name(),
        }
    }

    /// Push one sample.
    pub async fn push(&self, sample: Sample) -> Result<()> {
        match self {
            Self::CloudWatch(s) => s.push(&sample).await,
            Self::Prometheus(s) => {
                s.push(&sample);
                Ok(())
            }
            Self::InfluxDb(s) => s.push(&sample).await,
        }
    }
}

/// Set of configured sinks. Every sample goes to every sink on its own task.
#[derive(Default)]
pub struct Fanout {
    sinks: Vec<Arc<Sink>>,
    push_errors: Option<CounterVec>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink.
    pub fn add(&mut self, sink: Sink) {
        tracing::info!(sink = sink.name(), "sink registered");
        self.sinks.push(Arc::new(sink));
    }

    /// Count failed pushes in `counter`, labelled by sink name.
    pub fn with_error_counter(mut self, counter: CounterVec) -> Self {
        self.push_errors = Some(counter);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Spawn one detached push per sink. Must run inside a Tokio runtime
    /// unless no sinks are registered.
    pub fn dispatch(&self, sample: Sample) {
        for sink in &self.sinks {
            let sink = Arc::clone(sink);
            let push_errors = self.push_errors.clone();

            tokio::spawn(async move {
                if let Err(e) = sink.push(sample).await {
                    tracing::warn!(sink = sink.name(), error = %e, "sink push failed");
                    if let Some(counter) = push_errors {
                        counter.with_label_values(&[sink.name()]).inc();
                    }
                }
            });
        }
    }
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::store::RecordStore;
use crate::aggregator::{Aggregator, Observation};
use crate::chain::poller::Poller;
use crate::chain::{self, ChainReader};
use crate::config::{Config, Consensus};
use crate::server::QueryServer;
use crate::sink::cloudwatch::CloudWatchSink;
use crate::sink::influxdb::InfluxDbSink;
use crate::sink::prometheus::PrometheusSink;
use crate::sink::report::ReportWriter;
use crate::sink::{Fanout, Sink};

/// Monitor wires the chain reader, aggregator, sinks and servers together
/// and owns the stop signal.
pub struct Monitor {
    cfg: Config,
    consensus: Consensus,
    store: RecordStore,
    prometheus: Option<Arc<PrometheusSink>>,
    query: QueryServer,
    query_addr: Option<SocketAddr>,
    cancel: CancellationToken,
}

impl Monitor {
    /// Validates `cfg` and creates the monitor. Nothing is started yet.
    pub fn new(cfg: Config) -> Result<Self> {
        cfg.validate().context("invalid configuration")?;
        let consensus = cfg.consensus()?;

        let prometheus = if cfg.sinks.prometheus.enabled {
            Some(Arc::new(
                PrometheusSink::new(&cfg.sinks.prometheus.addr)
                    .context("creating prometheus metrics")?,
            ))
        } else {
            None
        };

        let store = RecordStore::new();
        let query = QueryServer::new(&cfg.server.addr, store.clone());

        Ok(Self {
            cfg,
            consensus,
            store,
            prometheus,
            query,
            query_addr: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops the monitor when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Records emitted so far.
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Bound address of the query server, once started.
    pub fn query_addr(&self) -> Option<SocketAddr> {
        self.query_addr
    }

    /// Start the query server and, when enabled, the Prometheus endpoint.
    pub async fn start(&mut self) -> Result<()> {
        info!(consensus = self.consensus.as_str(), "starting tps monitor");

        if let Some(prom) = &self.prometheus {
            prom.start()
                .await
                .context("starting prometheus metrics server")?;
        }

        let addr = self.query.start().await.context("starting tps query server")?;
        self.query_addr = Some(addr);

        Ok(())
    }

    /// Run against the configured JSON-RPC endpoint.
    ///
    /// Range mode returns once every block is processed. Streaming mode
    /// returns `Ok` when the monitor is stopped and an error when the chain
    /// reader gives up.
    pub async fn run(&self) -> Result<()> {
        let client = self.create_chain_client()?;
        self.run_with(Arc::new(client)).await
    }

    /// Run against any chain reader.
    pub async fn run_with<R: ChainReader + 'static>(&self, reader: Arc<R>) -> Result<()> {
        let mut aggregator = self.build_aggregator()?;

        if self.cfg.range.is_given() {
            let (from, to) = (self.cfg.range.from_block, self.cfg.range.to_block);
            info!(from, to, "calculating tps for block range");

            replay(reader.as_ref(), &mut aggregator, from, to, &self.cancel).await?;
            self.log_summary();

            Ok(())
        } else {
            info!("calculating tps for new blocks");

            stream(
                reader,
                &mut aggregator,
                self.cfg.poll_interval,
                self.cfg.heartbeat_interval,
                &self.cancel,
            )
            .await
        }
    }

    /// Signal every task to stop and shut the servers down.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.query.stop();

        if let Some(prom) = &self.prometheus {
            prom.stop();
        }

        info!(records = self.store.len(), "tps monitor stopped");
    }

    /// Create a chain client, with request metrics when Prometheus is on.
    fn create_chain_client(&self) -> Result<chain::Client> {
        let client = chain::Client::new(&self.cfg.rpc).context("creating chain client")?;

        Ok(match &self.prometheus {
            Some(prom) => client.with_metrics(prom.rpc_metrics_callback()),
            None => client,
        })
    }

    fn build_aggregator(&self) -> Result<Aggregator> {
        let mut sinks = Fanout::new();
        if let Some(prom) = &self.prometheus {
            sinks = sinks.with_error_counter(prom.sink_push_errors.clone());
        }

        let cloudwatch = &self.cfg.sinks.cloudwatch;
        if cloudwatch.enabled {
            sinks.add(Sink::CloudWatch(CloudWatchSink::new(cloudwatch.clone())));
        }

        if let Some(prom) = &self.prometheus {
            sinks.add(Sink::Prometheus(Arc::clone(prom)));
        }

        let influx = &self.cfg.sinks.influxdb;
        if influx.enabled {
            sinks.add(Sink::InfluxDb(
                InfluxDbSink::new(influx.clone()).context("creating influxdb sink")?,
            ));
        }

        let mut aggregator = Aggregator::new(self.consensus, self.store.clone()).with_sinks(sinks);

        if !self.cfg.report.path.is_empty() {
            let report = ReportWriter::create(&self.cfg.report.path)
                .context("creating tps report file")?;
            aggregator = aggregator.with_report(report);
        }

        if let Some(prom) = &self.prometheus {
            aggregator = aggregator.with_records_counter(prom.records_emitted.clone());
        }

        Ok(aggregator)
    }

    fn log_summary(&self) {
        let records = self.store.snapshot();
        info!(records = records.len(), "total tps records");
        for (i, record) in records.iter().enumerate() {
            info!("{i}. {record}");
        }
    }
}

/// Feed every block of `[from, to]` to the aggregator, in order.
///
/// Any read failure, including a missing block, aborts the replay.
pub async fn replay<R: ChainReader>(
    reader: &R,
    aggregator: &mut Aggregator,
    from: u64,
    to: u64,
    cancel: &CancellationToken,
) -> Result<()> {
    if from > to {
        bail!("from block {from} is greater than to block {to}");
    }

    for number in from..=to {
        if cancel.is_cancelled() {
            warn!(block = number, "block range replay stopped");
            return Ok(());
        }

        let block = reader
            .get_block(number)
            .await
            .with_context(|| format!("reading block {number}"))?;

        aggregator.observe(Observation::Block(block));
    }

    Ok(())
}

/// Aggregate new blocks as they are produced until `cancel` fires.
///
/// Heartbeats on `heartbeat_interval` let the aggregator emit records while
/// no blocks arrive. The reader's sentinel is an error unless the stream
/// was cancelled.
pub async fn stream<R: ChainReader + 'static>(
    reader: Arc<R>,
    aggregator: &mut Aggregator,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(1);
    let poller_cancel = cancel.child_token();
    let _poller = Poller::new(reader, tx, poll_interval).spawn(poller_cancel.clone());

    let mut heartbeat =
        tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!("tps monitor stopped, exiting loop");
                break Ok(());
            }
            event = rx.recv() => match event {
                Some(Some(block)) => {
                    info!(%block, "received new block");
                    aggregator.observe(Observation::Block(block));
                }
                Some(None) | None => {
                    if cancel.is_cancelled() {
                        break Ok(());
                    }
                    break Err(anyhow::anyhow!("reading block data failed"));
                }
            },
            _ = heartbeat.tick() => {
                aggregator.observe(Observation::Heartbeat(SystemTime::now()));
            }
        }
    };

    // Closing the receiver first keeps the poller from blocking on a full channel.
    drop(rx);
    poller_cancel.cancel();

    result
}

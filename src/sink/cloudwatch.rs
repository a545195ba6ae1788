use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_cloudwatch::config::Region;
use aws_sdk_cloudwatch::primitives::DateTime;
use aws_sdk_cloudwatch::types::{Dimension, MetricDatum};
use aws_sdk_cloudwatch::Client;
use tokio::sync::OnceCell;

use super::Sample;
use crate::config::CloudWatchSinkConfig;

/// Dimension attached to every datum.
const DIMENSION_NAME: &str = "System";
const DIMENSION_VALUE: &str = "TpsMonitor";

/// Publishes every sample to AWS CloudWatch as three datums in the
/// `{network}-{instance}` namespace.
pub struct CloudWatchSink {
    cfg: CloudWatchSinkConfig,
    namespace: String,
    /// Loaded on first push, credential resolution is async.
    client: OnceCell<Client>,
}

impl CloudWatchSink {
    pub fn new(cfg: CloudWatchSinkConfig) -> Self {
        let namespace = format!("{}-{}", cfg.network, cfg.instance);

        Self {
            cfg,
            namespace,
            client: OnceCell::new(),
        }
    }

    /// Returns the sink name for logging.
    pub fn name(&self) -> &str {
        "cloudwatch"
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Metric names and values published for a sample.
    pub fn values(sample: &Sample) -> [(&'static str, f64); 3] {
        [
            ("TPS", f64::from(sample.tps)),
            ("TxnCount", sample.transactions as f64),
            ("BlockCount", sample.blocks as f64),
        ]
    }

    /// Builds the datums for one sample, stamped with its block-time boundary.
    pub fn metric_data(&self, sample: &Sample) -> Result<Vec<MetricDatum>> {
        let timestamp = DateTime::from(sample.timestamp);
        let dimension = Dimension::builder()
            .name(DIMENSION_NAME)
            .value(DIMENSION_VALUE)
            .build();

        Self::values(sample)
            .into_iter()
            .map(|(name, value)| {
                Ok(MetricDatum::builder()
                    .metric_name(name)
                    .value(value)
                    .timestamp(timestamp)
                    .dimensions(dimension.clone())
                    .build())
            })
            .collect()
    }

    /// Sends one sample in a single `PutMetricData` call.
    pub async fn push(&self, sample: &Sample) -> Result<()> {
        let data = self.metric_data(sample)?;

        self.client()
            .await
            .put_metric_data()
            .namespace(&self.namespace)
            .set_metric_data(Some(data))
            .send()
            .await
            .with_context(|| format!("putting metric data to {}", self.namespace))?;

        tracing::debug!(
            namespace = %self.namespace,
            tps = sample.tps,
            "published metric data to cloudwatch",
        );

        Ok(())
    }

    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| async {
                let mut loader = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(self.cfg.region.clone()));
                if let Some(url) = &self.cfg.endpoint_url {
                    loader = loader.endpoint_url(url);
                }
                Client::new(&loader.load().await)
            })
            .await
    }
}

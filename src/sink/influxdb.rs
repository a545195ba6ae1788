use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use reqwest::Url;

use super::Sample;
use crate::config::InfluxDbSinkConfig;

/// Writes samples to an InfluxDB v2 write endpoint in line protocol.
pub struct InfluxDbSink {
    cfg: InfluxDbSinkConfig,
    write_url: Url,
    tags: BTreeMap<String, String>,
    client: Mutex<reqwest::Client>,
}

impl InfluxDbSink {
    pub fn new(cfg: InfluxDbSinkConfig) -> Result<Self> {
        let write_url = write_url(&cfg)?;
        let tags = parse_tags(&cfg.tags);
        let client = build_client(&cfg)?;

        Ok(Self {
            cfg,
            write_url,
            tags,
            client: Mutex::new(client),
        })
    }

    /// Returns the sink name for logging.
    pub fn name(&self) -> &str {
        "influxdb"
    }

    /// Renders one sample as a line-protocol point.
    pub fn line(&self, sample: &Sample) -> String {
        serialize_point(&self.cfg.measurement, &self.tags, sample)
    }

    /// Writes one point. A failed write replaces the HTTP client so the
    /// next push starts from a fresh connection pool.
    pub async fn push(&self, sample: &Sample) -> Result<()> {
        let client = self.client.lock().clone();

        let result = self.write(&client, self.line(sample)).await;
        if result.is_err() {
            match build_client(&self.cfg) {
                Ok(fresh) => *self.client.lock() = fresh,
                Err(e) => tracing::warn!(error = %e, "rebuilding influxdb client"),
            }
        }

        result
    }

    async fn write(&self, client: &reqwest::Client, body: String) -> Result<()> {
        let resp = client
            .post(self.write_url.clone())
            .header("Authorization", format!("Token {}", self.cfg.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .context("sending influxdb write request")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("influxdb write unexpected status {status}: {text}");
        }

        tracing::debug!(bucket = %self.cfg.bucket, "wrote point to influxdb");

        Ok(())
    }
}

fn build_client(cfg: &InfluxDbSinkConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(cfg.timeout)
        .build()
        .context("building influxdb HTTP client")
}

fn write_url(cfg: &InfluxDbSinkConfig) -> Result<Url> {
    let base = Url::parse(&cfg.endpoint)
        .with_context(|| format!("parsing influxdb endpoint {:?}", cfg.endpoint))?;

    let mut url = base
        .join("/api/v2/write")
        .context("building influxdb write url")?;

    url.query_pairs_mut()
        .append_pair("org", &cfg.org)
        .append_pair("bucket", &cfg.bucket)
        .append_pair("precision", "ns");

    Ok(url)
}

/// Parses "k1=v1,k2=v2". Entries without exactly one '=' are skipped.
pub fn parse_tags(s: &str) -> BTreeMap<String, String> {
    s.split(',')
        .filter_map(|entry| {
            let parts: Vec<&str> = entry.split('=').collect();
            match parts.as_slice() {
                [k, v] => Some((k.to_string(), v.to_string())),
                _ => None,
            }
        })
        .collect()
}

fn serialize_point(measurement: &str, tags: &BTreeMap<String, String>, sample: &Sample) -> String {
    let mut line = String::with_capacity(128);
    line.push_str(&escape(measurement, &[',', ' ']));

    for (k, v) in tags {
        let _ = write!(
            line,
            ",{}={}",
            escape(k, &[',', '=', ' ']),
            escape(v, &[',', '=', ' '])
        );
    }

    let _ = write!(
        line,
        " tps={},transactions={},blocks={} {}",
        f64::from(sample.tps),
        sample.transactions as f64,
        sample.blocks as f64,
        unix_nanos(sample.timestamp)
    );

    line
}

fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn unix_nanos(t: SystemTime) -> u128 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn cfg(endpoint: &str) -> InfluxDbSinkConfig {
        InfluxDbSinkConfig {
            enabled: true,
            endpoint: endpoint.to_string(),
            token: "user:pass".to_string(),
            org: "acme".to_string(),
            bucket: "telegraf".to_string(),
            measurement: "quorum_tps".to_string(),
            tags: "system=quorum,comp=tps".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    fn sample() -> Sample {
        Sample {
            timestamp: UNIX_EPOCH + Duration::from_secs(2),
            tps: 10_000,
            transactions: 190_000,
            blocks: 19,
        }
    }

    #[test]
    fn test_parse_tags() {
        let tags = parse_tags("system=quorum,comp=tps");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags["system"], "quorum");
        assert_eq!(tags["comp"], "tps");
    }

    #[test]
    fn test_parse_tags_skips_malformed() {
        let tags = parse_tags("a=1,broken,b=2=3,,c=3");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags["a"], "1");
        assert_eq!(tags["c"], "3");
    }

    #[test]
    fn test_serialize_point() {
        let sink = InfluxDbSink::new(cfg("http://localhost:8086")).expect("new sink");
        assert_eq!(
            sink.line(&sample()),
            "quorum_tps,comp=tps,system=quorum tps=10000,transactions=190000,blocks=19 2000000000"
        );
    }

    #[test]
    fn test_serialize_point_escapes() {
        let tags = parse_tags("host name=a,b");
        let line = serialize_point("my measurement", &tags, &sample());
        assert!(line.starts_with("my\\ measurement,host\\ name=a tps="));
    }

    #[test]
    fn test_write_url() {
        let url = write_url(&cfg("http://localhost:8086")).expect("url");
        assert_eq!(
            url.as_str(),
            "http://localhost:8086/api/v2/write?org=acme&bucket=telegraf&precision=ns"
        );
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(InfluxDbSink::new(cfg("not a url")).is_err());
    }

    #[tokio::test]
    async fn test_push_writes_line_protocol() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v2/write")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("org".into(), "acme".into()),
                mockito::Matcher::UrlEncoded("bucket".into(), "telegraf".into()),
                mockito::Matcher::UrlEncoded("precision".into(), "ns".into()),
            ]))
            .match_header("authorization", "Token user:pass")
            .match_body(
                "quorum_tps,comp=tps,system=quorum tps=10000,transactions=190000,blocks=19 2000000000",
            )
            .with_status(204)
            .create_async()
            .await;

        let sink = InfluxDbSink::new(cfg(&server.url())).expect("new sink");
        sink.push(&sample()).await.expect("push");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_failure_keeps_sink_usable() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/api/v2/write")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .with_body("boom")
            .expect(1)
            .create_async()
            .await;

        let sink = InfluxDbSink::new(cfg(&server.url())).expect("new sink");
        let err = sink.push(&sample()).await.expect_err("push should fail");
        assert!(err.to_string().contains("500"));
        failing.assert_async().await;
        failing.remove_async().await;

        let ok = server
            .mock("POST", "/api/v2/write")
            .match_query(mockito::Matcher::Any)
            .with_status(204)
            .create_async()
            .await;

        sink.push(&sample()).await.expect("push after rebuild");
        ok.assert_async().await;
    }
}

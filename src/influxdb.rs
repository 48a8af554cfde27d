//! InfluxDB sink for the resilient archive
//!
//! This module provides an async InfluxDB 2.x client that:
//! - Verifies the server with a health check on connect
//! - Ensures the target bucket exists (idempotent)
//! - Maps archive writes onto measurements tagged by device
//!
//! InfluxDB overwrites a point with the same measurement, tag set and
//! timestamp, so replaying a backlog entry twice does not duplicate data.
//! A write the server refuses as malformed or out of retention is reported
//! as rejected so the archive can set it aside.

use anyhow::{Context, Result};
use async_trait::async_trait;
use influxdb2::models::DataPoint;
use influxdb2::{Client, RequestError};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::archive::{ArchiveWrite, Sink, SinkConnector, SinkError};
use crate::config::InfluxDbConfig;

/// Measurement holding raw frames
pub const FRAMES_MEASUREMENT: &str = "radio_frames";

/// Measurement holding device display names
pub const NAMES_MEASUREMENT: &str = "device_names";

/// Device tag value, e.g. `00ee58`
pub fn device_tag(device_id: u32) -> String {
    format!("{:06x}", device_id)
}

/// Measurement a write lands in
pub fn measurement(write: &ArchiveWrite) -> &'static str {
    match write {
        ArchiveWrite::Frame { .. } => FRAMES_MEASUREMENT,
        ArchiveWrite::Metric { channel, .. } => channel.as_str(),
        ArchiveWrite::DeviceName { .. } => NAMES_MEASUREMENT,
    }
}

/// Build the data point for an archive write
pub fn to_point(write: &ArchiveWrite) -> Result<DataPoint> {
    let builder = DataPoint::builder(measurement(write)).tag("device", device_tag(write.device_id()));

    let builder = match write {
        ArchiveWrite::Frame {
            time, rssi, frame, ..
        } => builder
            .field("rssi", *rssi)
            .field("frame", hex::encode(frame))
            .timestamp(nanos(time)?),
        ArchiveWrite::Metric { time, value, .. } => {
            builder.field("value", *value).timestamp(nanos(time)?)
        }
        ArchiveWrite::DeviceName { time, label, .. } => builder
            .field("name", label.clone())
            .timestamp(nanos(time)?),
    };

    builder.build().context("Failed to build data point")
}

/// Write statuses that will fail the same way on every retry
///
/// 400: unparsable line protocol, 413: body too large,
/// 422: point outside the bucket's retention.
pub fn is_permanent_rejection(status: u16) -> bool {
    matches!(status, 400 | 413 | 422)
}

fn nanos(time: &chrono::DateTime<chrono::Utc>) -> Result<i64> {
    time.timestamp_nanos_opt()
        .with_context(|| format!("Timestamp out of range: {}", time))
}

#[derive(Debug, Deserialize)]
struct BucketList {
    #[serde(default)]
    buckets: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OrgList {
    #[serde(default)]
    orgs: Vec<Org>,
}

#[derive(Debug, Deserialize)]
struct Org {
    id: String,
}

/// InfluxDB client for archive writes
pub struct InfluxDbClient {
    client: Client,
    http: reqwest::Client,
    url: String,
    org: String,
    bucket: String,
    token: String,
}

impl InfluxDbClient {
    /// Create a new InfluxDB client
    ///
    /// # Arguments
    /// * `url` - InfluxDB server URL (e.g., "http://localhost:8086")
    /// * `org` - Organization name
    /// * `bucket` - Bucket name for data storage
    /// * `token` - Authentication token
    pub fn new(url: &str, org: &str, bucket: &str, token: &str) -> Result<Self> {
        info!(url = url, org = org, bucket = bucket, "Creating InfluxDB client");

        let client = Client::new(url, org, token);
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            http,
            url: url.trim_end_matches('/').to_string(),
            org: org.to_string(),
            bucket: bucket.to_string(),
            token: token.to_string(),
        })
    }

    /// Test connection to InfluxDB with health check
    pub async fn health_check(&self) -> Result<()> {
        // The influxdb2 crate doesn't expose /health, so ask the server directly
        let health_url = format!("{}/health", self.url);

        let response = self
            .http
            .get(&health_url)
            .send()
            .await
            .context("Failed to connect to InfluxDB health endpoint")?;

        let status = response.status();
        if status.is_success() {
            debug!(status = %status, "InfluxDB health check passed");
            Ok(())
        } else {
            anyhow::bail!("InfluxDB health check failed with status: {}", status)
        }
    }

    async fn bucket_exists(&self) -> Result<bool> {
        let list: BucketList = self
            .http
            .get(format!("{}/api/v2/buckets", self.url))
            .header("Authorization", format!("Token {}", self.token))
            .query(&[("name", self.bucket.as_str()), ("org", self.org.as_str())])
            .send()
            .await
            .context("Failed to list InfluxDB buckets")?
            .error_for_status()
            .context("InfluxDB rejected bucket lookup")?
            .json()
            .await
            .context("Failed to parse bucket list")?;

        Ok(!list.buckets.is_empty())
    }

    async fn org_id(&self) -> Result<String> {
        let list: OrgList = self
            .http
            .get(format!("{}/api/v2/orgs", self.url))
            .header("Authorization", format!("Token {}", self.token))
            .query(&[("org", self.org.as_str())])
            .send()
            .await
            .context("Failed to look up InfluxDB organization")?
            .error_for_status()
            .context("InfluxDB rejected organization lookup")?
            .json()
            .await
            .context("Failed to parse organization list")?;

        list.orgs
            .into_iter()
            .next()
            .map(|org| org.id)
            .with_context(|| format!("InfluxDB organization not found: {}", self.org))
    }

    async fn create_bucket(&self) -> Result<()> {
        let org_id = self.org_id().await?;

        // empty retention rules keep data forever
        let body = json!({
            "orgID": org_id,
            "name": self.bucket,
            "retentionRules": [],
        });

        let response = self
            .http
            .post(format!("{}/api/v2/buckets", self.url))
            .header("Authorization", format!("Token {}", self.token))
            .json(&body)
            .send()
            .await
            .context("Failed to create InfluxDB bucket")?;

        let status = response.status();
        // 422: created concurrently by someone else
        if status.is_success() || status == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            info!(bucket = %self.bucket, "InfluxDB bucket ready");
            Ok(())
        } else {
            anyhow::bail!("InfluxDB bucket creation failed with status: {}", status)
        }
    }

    /// Write a single data point to the bucket
    pub async fn write_point(&self, point: DataPoint) -> std::result::Result<(), SinkError> {
        match self
            .client
            .write(&self.bucket, futures::stream::iter(vec![point]))
            .await
        {
            Ok(()) => Ok(()),
            Err(RequestError::Http { status, text }) if is_permanent_rejection(status.as_u16()) => {
                Err(SinkError::Rejected(format!("InfluxDB returned {}: {}", status, text)))
            }
            Err(e) => Err(anyhow::Error::new(e)
                .context("Failed to write data point to InfluxDB")
                .into()),
        }
    }
}

#[async_trait]
impl Sink for InfluxDbClient {
    async fn ensure_schema(&self) -> Result<()> {
        if self.bucket_exists().await? {
            debug!(bucket = %self.bucket, "InfluxDB bucket exists");
            return Ok(());
        }
        self.create_bucket().await
    }

    async fn execute(&self, write: &ArchiveWrite) -> std::result::Result<(), SinkError> {
        let point = to_point(write).map_err(|e| SinkError::Rejected(format!("{e:#}")))?;
        self.write_point(point).await?;

        debug!(
            measurement = measurement(write),
            device = %device_tag(write.device_id()),
            "Wrote data point to InfluxDB"
        );
        Ok(())
    }
}

/// Opens [`InfluxDbClient`] connections from configuration
pub struct InfluxDbConnector {
    config: InfluxDbConfig,
}

impl InfluxDbConnector {
    pub fn new(config: InfluxDbConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SinkConnector for InfluxDbConnector {
    async fn connect(&self) -> Result<Box<dyn Sink>> {
        let client = InfluxDbClient::new(
            &self.config.url,
            &self.config.org,
            &self.config.bucket,
            &self.config.token,
        )?;
        client.health_check().await?;
        info!(url = %self.config.url, "InfluxDB connection verified");
        Ok(Box::new(client))
    }
}

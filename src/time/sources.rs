//! Time oracles: SNTP servers and HTTP time APIs.

use crate::error::SourceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::debug;

/// Seconds between the NTP era (1900) and the Unix epoch.
const NTP_UNIX_OFFSET: f64 = 2_208_988_800.0;
const NTP_PACKET_LEN: usize = 48;
const NTP_PORT: u16 = 123;

/// A successful reading from one time source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeReading {
    /// Reference time minus local time, in seconds.
    pub offset: f64,
    /// Round-trip delay in seconds.
    pub delay: f64,
    /// NTP stratum, or a fixed rank for sources without one.
    pub stratum: u8,
}

/// Something that can tell how far the local clock is from reference time.
#[async_trait]
pub trait TimeSource: Send + Sync {
    /// Stable identifier, used as the key in consensus and packets.
    fn id(&self) -> &str;

    /// Query the source once. The caller bounds this with its own timeout.
    async fn query(&self) -> Result<TimeReading, SourceError>;
}

/// Current local time as fractional Unix seconds.
pub fn unix_now() -> f64 {
    unix_seconds(&Utc::now())
}

pub fn unix_seconds(time: &DateTime<Utc>) -> f64 {
    time.timestamp() as f64 + f64::from(time.timestamp_subsec_nanos()) / 1e9
}

/// SNTPv4 client for a single server.
pub struct NtpSource {
    host: String,
}

impl NtpSource {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

/// Build a client request carrying `transmit` (Unix seconds) as its
/// transmit timestamp.
pub fn build_ntp_request(transmit: f64) -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    // LI = 0, VN = 4, Mode = 3 (client)
    packet[0] = 0x23;
    packet[40..48].copy_from_slice(&to_ntp_timestamp(transmit).to_be_bytes());
    packet
}

/// Compute offset and delay from a server response.
///
/// `t1` is the local send time and `t4` the local receive time, both in
/// Unix seconds.
pub fn parse_ntp_response(buf: &[u8], t1: f64, t4: f64) -> Result<TimeReading, SourceError> {
    if buf.len() < NTP_PACKET_LEN {
        return Err(SourceError::Parse(format!(
            "short NTP packet ({} bytes)",
            buf.len()
        )));
    }

    let mode = buf[0] & 0x07;
    if mode != 4 {
        return Err(SourceError::Parse(format!("unexpected NTP mode {}", mode)));
    }

    let stratum = buf[1];
    if stratum == 0 {
        return Err(SourceError::Parse("kiss-of-death (stratum 0)".to_string()));
    }

    let t2 = from_ntp_timestamp(read_u64(&buf[32..40]));
    let t3 = from_ntp_timestamp(read_u64(&buf[40..48]));
    if t3 <= 0.0 {
        return Err(SourceError::Parse("empty transmit timestamp".to_string()));
    }

    let offset = ((t2 - t1) + (t3 - t4)) / 2.0;
    let delay = ((t4 - t1) - (t3 - t2)).max(0.0);

    Ok(TimeReading {
        offset,
        delay,
        stratum,
    })
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_be_bytes(raw)
}

fn to_ntp_timestamp(unix: f64) -> u64 {
    let ntp = unix + NTP_UNIX_OFFSET;
    let secs = ntp.trunc();
    let frac = ((ntp - secs) * 4_294_967_296.0) as u64;
    ((secs as u64) << 32) | (frac & 0xFFFF_FFFF)
}

fn from_ntp_timestamp(raw: u64) -> f64 {
    if raw == 0 {
        return 0.0;
    }
    let secs = (raw >> 32) as f64;
    let frac = (raw & 0xFFFF_FFFF) as f64 / 4_294_967_296.0;
    secs + frac - NTP_UNIX_OFFSET
}

#[async_trait]
impl TimeSource for NtpSource {
    fn id(&self) -> &str {
        &self.host
    }

    async fn query(&self) -> Result<TimeReading, SourceError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((self.host.as_str(), NTP_PORT)).await?;

        let t1 = unix_now();
        socket.send(&build_ntp_request(t1)).await?;

        let mut buf = [0u8; 68];
        let len = socket.recv(&mut buf).await?;
        let t4 = unix_now();

        let reading = parse_ntp_response(&buf[..len], t1, t4)?;
        debug!(
            "NTP {}: offset {:.6}s delay {:.6}s stratum {}",
            self.host, reading.offset, reading.delay, reading.stratum
        );
        Ok(reading)
    }
}

/// JSON time API over HTTP.
pub struct HttpTimeSource {
    url: String,
    client: reqwest::Client,
}

impl HttpTimeSource {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

/// Extract the reported server time from a time API body.
///
/// Accepts `datetime` (RFC 3339), `dateTime` (no offset, read as UTC) or
/// `unixtime` (seconds).
pub fn parse_http_time(body: &Value) -> Result<f64, SourceError> {
    for key in ["datetime", "dateTime"] {
        if let Some(raw) = body.get(key).and_then(|v| v.as_str()) {
            let parsed = crate::models::parse_timestamp(raw).map_err(SourceError::Parse)?;
            return Ok(unix_seconds(&parsed));
        }
    }

    if let Some(unix) = body.get("unixtime").and_then(|v| v.as_f64()) {
        return Ok(unix);
    }

    Err(SourceError::Parse(
        "no datetime, dateTime or unixtime field".to_string(),
    ))
}

#[async_trait]
impl TimeSource for HttpTimeSource {
    fn id(&self) -> &str {
        &self.url
    }

    async fn query(&self) -> Result<TimeReading, SourceError> {
        let sent_at = unix_now();
        let started = Instant::now();

        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(SourceError::Status(response.status().as_u16()));
        }
        let body: Value = response.json().await?;

        let round_trip = started.elapsed().as_secs_f64();
        let server_time = parse_http_time(&body)?;

        // Assume the server stamped the response halfway through the round trip
        let local_mid = sent_at + round_trip / 2.0;

        Ok(TimeReading {
            offset: server_time - local_mid,
            delay: round_trip,
            stratum: 1,
        })
    }
}

/// Build an HTTP client shared by the HTTP time sources.
pub fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("livestamp/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

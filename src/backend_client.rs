use crate::gateway::Address;
use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};

const STATUS_TIMEOUT: Duration = Duration::from_millis(3000);
const SERVER_TIME_TIMEOUT: Duration = Duration::from_millis(2000);

/// The backend's view of the active round, plus its own clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundStatus {
    pub round_id: u64,
    pub end_timestamp: u64,
    pub time_remaining: i64,
    pub next_draw_time: u64,
    pub server_timestamp: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerTime {
    pub timestamp: u64,
    pub milliseconds: u64,
}

/// Purchase details reported to the backend after a confirmed buy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurchaseReport {
    pub address: Address,
    pub round_id: u64,
    pub quantity: u32,
    pub total_value: u128,
}

/// The backend could not produce a usable answer. Callers degrade to a
/// fallback time source; this is never a hard error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendUnavailable {
    pub reason: String,
}

impl BackendUnavailable {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for BackendUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend unavailable: {}", self.reason)
    }
}

impl std::error::Error for BackendUnavailable {}

/// Source of authoritative round/time status. Implemented by the HTTP
/// [`BackendClient`] and by the in-crate fake.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self) -> Result<RoundStatus, BackendUnavailable>;

    async fn fetch_server_time(&self) -> Result<ServerTime, BackendUnavailable>;

    async fn report_purchase(
        &self,
        report: &PurchaseReport,
    ) -> Result<(), BackendUnavailable>;
}

/// HTTP client for the lottery backend.
#[derive(Clone)]
pub struct BackendClient {
    base_url: String,
    http: reqwest::Client,
    request_count: Arc<AtomicU64>,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BackendUnavailable> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| BackendUnavailable::new(format!("building HTTP client: {e}")))?;
        Ok(Self {
            base_url,
            http,
            request_count: Arc::new(AtomicU64::new(0)),
        })
    }

    fn next_request_id(&self) -> String {
        let count = self.request_count.fetch_add(1, Ordering::Relaxed) + 1;
        let suffix: u32 = rand::rng().random_range(0..1000);
        format!("REQ-{count}-{suffix}")
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<T, BackendUnavailable> {
        let url = format!("{}{}", self.base_url, path);
        let res = self
            .http
            .get(&url)
            .timeout(timeout)
            .header("X-Request-ID", self.next_request_id())
            .header("Cache-Control", "no-cache, no-store, must-revalidate")
            .send()
            .await
            .map_err(|e| BackendUnavailable::new(format!("request to {path} failed: {e}")))?;
        let status = res.status();
        let bytes = res
            .bytes()
            .await
            .map_err(|e| BackendUnavailable::new(format!("reading {path} body: {e}")))?;
        if status != StatusCode::OK {
            return Err(BackendUnavailable::new(format!(
                "{path} responded with {status}"
            )));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| BackendUnavailable::new(format!("invalid {path} payload: {e}")))
    }
}

#[async_trait]
impl StatusSource for BackendClient {
    async fn fetch_status(&self) -> Result<RoundStatus, BackendUnavailable> {
        let dto: StatusDto = self.get_json("/api/status", STATUS_TIMEOUT).await?;
        dto.try_into()
    }

    async fn fetch_server_time(&self) -> Result<ServerTime, BackendUnavailable> {
        let dto: ServerTimeBodyDto = self
            .get_json("/api/server-time", SERVER_TIME_TIMEOUT)
            .await?;
        Ok(ServerTime {
            timestamp: dto.timestamp,
            milliseconds: dto.milliseconds,
        })
    }

    async fn report_purchase(
        &self,
        report: &PurchaseReport,
    ) -> Result<(), BackendUnavailable> {
        let url = format!("{}/api/tickets/buy", self.base_url);
        let body = BuyReportDto {
            address: report.address.to_string(),
            round_id: report.round_id,
            quantity: report.quantity,
            total_value: report.total_value.to_string(),
        };
        let res = self
            .http
            .post(&url)
            .timeout(STATUS_TIMEOUT)
            .header("X-Request-ID", self.next_request_id())
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendUnavailable::new(format!("purchase report failed: {e}")))?;
        let status = res.status();
        if !status.is_success() {
            return Err(BackendUnavailable::new(format!(
                "purchase report rejected with {status}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for BackendClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_url)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusDto {
    #[serde(default)]
    success: bool,
    round_info: Option<RoundInfoDto>,
    server_time: Option<ServerTimeDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoundInfoDto {
    current_round_id: u64,
    round_end_timestamp: u64,
    time_remaining: i64,
    next_draw_time: u64,
}

#[derive(Deserialize)]
struct ServerTimeDto {
    timestamp: u64,
}

#[derive(Deserialize)]
struct ServerTimeBodyDto {
    timestamp: u64,
    #[serde(default)]
    milliseconds: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BuyReportDto {
    address: String,
    round_id: u64,
    quantity: u32,
    total_value: String,
}

impl TryFrom<StatusDto> for RoundStatus {
    type Error = BackendUnavailable;

    fn try_from(dto: StatusDto) -> Result<Self, Self::Error> {
        if !dto.success {
            return Err(BackendUnavailable::new("status reported success=false"));
        }
        let round = dto
            .round_info
            .ok_or_else(|| BackendUnavailable::new("status payload missing roundInfo"))?;
        let server = dto
            .server_time
            .ok_or_else(|| BackendUnavailable::new("status payload missing serverTime"))?;
        Ok(RoundStatus {
            round_id: round.current_round_id,
            end_timestamp: round.round_end_timestamp,
            time_remaining: round.time_remaining,
            next_draw_time: round.next_draw_time,
            server_timestamp: server.timestamp,
        })
    }
}

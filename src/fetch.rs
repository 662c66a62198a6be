pub mod archive;
pub mod circuit;
pub mod http;

use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::NaiveDate;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    datasets::{Dataset, Exchange},
    envelope::SchemaVersion,
    error::FetchError,
    fetch::{circuit::CircuitBreaker, http::HttpTransport},
};

// ================================================================================================
// Source descriptors
// ================================================================================================

/// Date rendering styles used by exchange bulletin URLs.
#[derive(
    Copy, Clone, Debug, Display, EnumString, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum DateStyle {
    /// `2024-01-02`
    Iso,
    /// `20240102`
    Compact,
    /// `020124`
    DdMmYy,
}

impl DateStyle {
    pub fn render(&self, date: NaiveDate) -> String {
        match self {
            DateStyle::Iso => date.format("%Y-%m-%d").to_string(),
            DateStyle::Compact => date.format("%Y%m%d").to_string(),
            DateStyle::DdMmYy => date.format("%d%m%y").to_string(),
        }
    }
}

#[derive(
    Copy, Clone, Debug, Display, EnumString, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum MediaKind {
    Csv,
    CsvZip,
}

/// Everything needed to locate one bulletin for one logical date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Low-cardinality source tag, e.g. `nse_cm_bhavcopy`.
    pub source: String,

    pub dataset: Dataset,
    pub exchange: Exchange,

    /// URL template with a `{date}` placeholder.
    pub url_template: String,
    pub date_style: DateStyle,
    pub media: MediaKind,

    /// Host identity for the circuit breaker, e.g. `archives.nseindia.com`.
    pub host: String,

    /// For zipped media: pattern the single expected CSV member must match.
    pub zip_member_pattern: Option<String>,

    pub schema_version: SchemaVersion,
}

impl SourceDescriptor {
    pub fn url_for(&self, date: NaiveDate) -> String {
        self.url_template
            .replace("{date}", &self.date_style.render(date))
    }
}

/// Answers whether a date was a declared trading day, when the calendar is
/// already materialized. `None` means the calendar has no coverage yet.
pub trait TradingDayOracle: Send + Sync {
    fn is_trading_day(&self, exchange: Exchange, date: NaiveDate) -> Option<bool>;
}

// ================================================================================================
// Fetcher
// ================================================================================================

/// Downloads one bulletin per call: bounded retries with jittered
/// exponential backoff, a per-host circuit breaker and ZIP verification.
pub struct Fetcher {
    transport: Arc<dyn HttpTransport>,
    breaker: CircuitBreaker,
    retries: u32,
    base_delay: Duration,
    download_dir: PathBuf,
    calendar: Option<Arc<dyn TradingDayOracle>>,
}

impl Fetcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        breaker: CircuitBreaker,
        retries: u32,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            transport,
            breaker,
            retries,
            base_delay: Duration::from_millis(500),
            download_dir,
            calendar: None,
        }
    }

    pub fn with_calendar(mut self, calendar: Arc<dyn TradingDayOracle>) -> Self {
        self.calendar = Some(calendar);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Fetches the bulletin for `date`.
    ///
    /// Returns `Ok(None)` when the remote authoritatively has no data for
    /// the date (404 on a declared non-trading day). All other failures
    /// surface as `FetchError`.
    #[tracing::instrument(skip(self, cancel), fields(source = %descriptor.source, %date))]
    pub async fn fetch(
        &self,
        descriptor: &SourceDescriptor,
        date: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<Option<PathBuf>, FetchError> {
        self.breaker.check(&descriptor.host)?;

        let url = descriptor.url_for(date);
        let body = match self.download_with_retries(descriptor, &url, date, cancel).await {
            Ok(Some(body)) => body,
            Ok(None) => return Ok(None),
            Err(e) => return Err(e),
        };

        std::fs::create_dir_all(&self.download_dir)?;
        let staged = self.stage(descriptor, date, &body)?;

        let local = match descriptor.media {
            MediaKind::Csv => staged,
            MediaKind::CsvZip => {
                let pattern = descriptor
                    .zip_member_pattern
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .map_err(|e| FetchError::Integrity {
                        source_id: descriptor.source.clone(),
                        msg: format!("bad zip member pattern: {e}"),
                    })?;
                let extracted = archive::extract_single_csv(
                    &staged,
                    pattern.as_ref(),
                    &self.download_dir,
                    &descriptor.source,
                )?;
                // The archive itself is no longer needed once the member is out.
                std::fs::remove_file(&staged)?;
                extracted
            }
        };

        info!(path = %local.display(), bytes = body.len(), "bulletin staged");
        Ok(Some(local))
    }

    async fn download_with_retries(
        &self,
        descriptor: &SourceDescriptor,
        url: &str,
        date: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<Option<bytes::Bytes>, FetchError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.transport.get(url, cancel).await {
                Ok(response) if response.status == 200 => {
                    self.breaker.record_success(&descriptor.host);
                    return Ok(Some(response.body));
                }
                Ok(response) if response.status == 404 => {
                    // 404 is authoritative on declared non-trading days.
                    self.breaker.record_success(&descriptor.host);
                    let trading = self
                        .calendar
                        .as_ref()
                        .and_then(|c| c.is_trading_day(descriptor.exchange, date));
                    return match trading {
                        Some(false) => Ok(None),
                        _ => Err(FetchError::NotFound {
                            source_id: descriptor.source.clone(),
                            date: date.to_string(),
                        }),
                    };
                }
                Ok(response) if retryable_status(response.status) => {
                    self.breaker.record_failure(&descriptor.host);
                    if attempt > self.retries {
                        return Err(FetchError::Status {
                            url: url.to_string(),
                            status: response.status,
                        });
                    }
                    warn!(status = response.status, attempt, "retryable upstream status");
                }
                Ok(response) => {
                    self.breaker.record_failure(&descriptor.host);
                    return Err(FetchError::Status {
                        url: url.to_string(),
                        status: response.status,
                    });
                }
                Err(e @ FetchError::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    self.breaker.record_failure(&descriptor.host);
                    if attempt > self.retries {
                        return Err(e);
                    }
                    warn!(error = %e, attempt, "retryable network error");
                }
            }

            let delay = backoff_delay(self.base_delay, attempt);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(FetchError::Cancelled { url: url.to_string() });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Write-temp-then-rename so a crash never leaves a partial bulletin
    /// under a final name.
    fn stage(
        &self,
        descriptor: &SourceDescriptor,
        date: NaiveDate,
        body: &bytes::Bytes,
    ) -> Result<PathBuf, FetchError> {
        let ext = match descriptor.media {
            MediaKind::Csv => "csv",
            MediaKind::CsvZip => "zip",
        };
        let final_path = self
            .download_dir
            .join(format!("{}_{}.{ext}", descriptor.source, date.format("%Y%m%d")));
        let tmp_path = final_path.with_extension(format!("{ext}.tmp"));

        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(final_path)
    }
}

fn retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

/// Bounded exponential backoff with full jitter.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(Duration::from_secs(60));
    let jitter_ms = rand::rng().random_range(0..=capped.as_millis() as u64);
    Duration::from_millis(jitter_ms.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_styles_render() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert_eq!(DateStyle::Iso.render(date), "2024-01-02");
        assert_eq!(DateStyle::Compact.render(date), "20240102");
        assert_eq!(DateStyle::DdMmYy.render(date), "020124");
    }

    #[test]
    fn url_template_substitutes_date() {
        let descriptor = SourceDescriptor {
            source: "nse_cm_bhavcopy".to_string(),
            dataset: Dataset::EquityOhlc,
            exchange: Exchange::Nse,
            url_template: "https://archives.nseindia.com/content/cm/BhavCopy_NSE_CM_0_0_0_{date}_F_0000.csv.zip".to_string(),
            date_style: DateStyle::Compact,
            media: MediaKind::CsvZip,
            host: "archives.nseindia.com".to_string(),
            zip_member_pattern: Some(r"BhavCopy.*\.csv$".to_string()),
            schema_version: SchemaVersion(1),
        };
        let url = descriptor.url_for(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert!(url.contains("20240102"));
        assert!(!url.contains("{date}"));
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let base = Duration::from_millis(500);
        for attempt in 1..10 {
            let delay = backoff_delay(base, attempt);
            assert!(delay >= Duration::from_millis(1));
            assert!(delay <= Duration::from_secs(60));
        }
    }

    #[test]
    fn retryable_statuses() {
        assert!(retryable_status(503));
        assert!(retryable_status(429));
        assert!(retryable_status(408));
        assert!(!retryable_status(403));
        assert!(!retryable_status(404));
    }
}

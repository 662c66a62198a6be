use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use champion::{
    config::ChampionConfig,
    datasets::{Dataset, Exchange},
    envelope::SchemaVersion,
    error::{FetchError, WarehouseError},
    fetch::{DateStyle, Fetcher, MediaKind, SourceDescriptor, circuit::CircuitBreaker, http::{HttpResponse, HttpTransport}},
    lake::{Compression, Lake},
    normalize::NormalizeOptions,
    pipeline::Pipeline,
    runtime::TaskContext,
    validate::Validator,
    warehouse::{WarehouseClient, loader::Loader, markers::MarkerStore, rows::{OhlcRow, TableRows}},
};
use tokio_util::sync::CancellationToken;

// ================================================================================================
// Scripted HTTP transport
// ================================================================================================

pub enum Scripted {
    Status(u16),
    OwnedBody(Vec<u8>),
}

/// Serves canned responses per URL, in order; counts every request so
/// tests can assert that the circuit breaker short-circuits.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    requests: Mutex<u32>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, url: &str, response: Scripted) {
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn request_count(&self) -> u32 {
        *self.requests.lock().unwrap()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(
        &self,
        url: &str,
        _cancel: &CancellationToken,
    ) -> Result<HttpResponse, FetchError> {
        *self.requests.lock().unwrap() += 1;
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(Scripted::Status(status)) => Ok(HttpResponse {
                status,
                body: Bytes::new(),
            }),
            Some(Scripted::OwnedBody(body)) => Ok(HttpResponse {
                status: 200,
                body: Bytes::from(body),
            }),
            None => Ok(HttpResponse {
                status: 404,
                body: Bytes::new(),
            }),
        }
    }
}

// ================================================================================================
// In-memory warehouse
// ================================================================================================

/// Stores OHLC rows so tests can query like the real warehouse.
#[derive(Default)]
pub struct MemoryWarehouse {
    pub ohlc: Mutex<Vec<OhlcRow>>,
    pub other_rows: Mutex<u64>,
}

impl MemoryWarehouse {
    pub fn ohlc_count(&self, symbol: &str, date: chrono::NaiveDate) -> usize {
        self.ohlc
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.symbol == symbol && r.trade_date == date)
            .count()
    }

    pub fn total_rows(&self) -> u64 {
        self.ohlc.lock().unwrap().len() as u64 + *self.other_rows.lock().unwrap()
    }
}

#[async_trait]
impl WarehouseClient for MemoryWarehouse {
    async fn execute(&self, _statement: &str) -> Result<(), WarehouseError> {
        Ok(())
    }

    async fn insert(&self, _table: &str, rows: &TableRows) -> Result<u64, WarehouseError> {
        match rows {
            TableRows::Ohlc(rows) => {
                self.ohlc.lock().unwrap().extend(rows.iter().cloned());
            }
            other => {
                *self.other_rows.lock().unwrap() += other.len() as u64;
            }
        }
        Ok(rows.len() as u64)
    }

    async fn count(&self, _table: &str, _predicate: &str) -> Result<u64, WarehouseError> {
        Ok(self.total_rows())
    }
}

// ================================================================================================
// Fixtures & setup
// ================================================================================================

pub const NSE_BHAV_URL: &str =
    "https://archives.nseindia.com/content/cm/bhav_{date}.csv";

pub fn nse_descriptor() -> SourceDescriptor {
    SourceDescriptor {
        source: "nse_cm_bhavcopy".to_string(),
        dataset: Dataset::EquityOhlc,
        exchange: Exchange::Nse,
        url_template: NSE_BHAV_URL.to_string(),
        date_style: DateStyle::Compact,
        media: MediaKind::Csv,
        host: "archives.nseindia.com".to_string(),
        zip_member_pattern: None,
        schema_version: SchemaVersion(1),
    }
}

pub fn nse_url(date: chrono::NaiveDate) -> String {
    NSE_BHAV_URL.replace("{date}", &date.format("%Y%m%d").to_string())
}

pub const NSE_CA_URL: &str =
    "https://archives.nseindia.com/content/corporate/CF-CA-{date}.csv";

pub fn ca_descriptor() -> SourceDescriptor {
    SourceDescriptor {
        source: "nse_corporate_actions".to_string(),
        dataset: Dataset::CorporateActions,
        exchange: Exchange::Nse,
        url_template: NSE_CA_URL.to_string(),
        date_style: DateStyle::Compact,
        media: MediaKind::Csv,
        host: "archives.nseindia.com".to_string(),
        zip_member_pattern: None,
        schema_version: SchemaVersion(1),
    }
}

pub fn ca_url(date: chrono::NaiveDate) -> String {
    NSE_CA_URL.replace("{date}", &date.format("%Y%m%d").to_string())
}

pub const NSE_MASTER_URL: &str =
    "https://archives.nseindia.com/content/equities/EQUITY_L_{date}.csv";

pub fn symbol_master_descriptor() -> SourceDescriptor {
    SourceDescriptor {
        source: "nse_symbol_master".to_string(),
        dataset: Dataset::SymbolMaster,
        exchange: Exchange::Nse,
        url_template: NSE_MASTER_URL.to_string(),
        date_style: DateStyle::Compact,
        media: MediaKind::Csv,
        host: "archives.nseindia.com".to_string(),
        zip_member_pattern: None,
        schema_version: SchemaVersion(1),
    }
}

pub fn symbol_master_url(date: chrono::NaiveDate) -> String {
    NSE_MASTER_URL.replace("{date}", &date.format("%Y%m%d").to_string())
}

/// A listed-securities master snapshot, one `(symbol, isin)` per row.
pub fn symbol_master_csv(entries: &[(&str, &str)]) -> String {
    let mut out = String::from(
        "SYMBOL,NAME OF COMPANY, SERIES, DATE OF LISTING, PAID UP VALUE, MARKET LOT, ISIN NUMBER, FACE VALUE\n",
    );
    for (symbol, isin) in entries {
        out.push_str(&format!(
            "{symbol},{symbol} Limited,EQ,29-NOV-1995,10,1,{isin},10\n"
        ));
    }
    out
}

/// A structurally valid NSE bhavcopy with `rows` distinct symbols.
pub fn nse_bhavcopy_csv(rows: usize, date_label: &str) -> String {
    let mut out = String::from(
        "SYMBOL,SERIES,OPEN,HIGH,LOW,CLOSE,LAST,PREVCLOSE,TOTTRDQTY,TOTTRDVAL,TIMESTAMP,TOTALTRADES,ISIN\n",
    );
    for i in 0..rows {
        let base = 100.0 + i as f64;
        out.push_str(&format!(
            "SYM{i},EQ,{open:.2},{high:.2},{low:.2},{close:.2},{close:.2},{prev:.2},{volume},{turnover:.2},{date_label},{trades},INE{i:06}A01\n",
            open = base,
            high = base + 2.0,
            low = base - 2.0,
            close = base + 1.0,
            prev = base - 1.0,
            volume = 1000 + i,
            turnover = (1000 + i) as f64 * base,
            trades = 100 + i,
        ));
    }
    out
}

/// One ticker, many instruments: same symbol and date, distinct ISINs.
pub fn multi_instrument_csv(symbol: &str, instruments: usize, date_label: &str) -> String {
    let mut out = String::from(
        "SYMBOL,SERIES,OPEN,HIGH,LOW,CLOSE,LAST,PREVCLOSE,TOTTRDQTY,TOTTRDVAL,TIMESTAMP,TOTALTRADES,ISIN\n",
    );
    for i in 0..instruments {
        out.push_str(&format!(
            "{symbol},{series},200.00,205.00,195.00,202.00,202.00,201.00,5000,1010000.00,{date_label},500,INE148I{i:04}1\n",
            series = if i == 0 { "EQ" } else { "N1" },
        ));
    }
    out
}

pub struct TestHarness {
    pub pipeline: Arc<Pipeline>,
    pub transport: Arc<ScriptedTransport>,
    pub warehouse: Arc<MemoryWarehouse>,
    pub ctx: TaskContext,
    pub config: Arc<ChampionConfig>,
}

/// Wires a full pipeline over temp directories, a scripted transport and
/// the in-memory warehouse.
pub fn harness(root: &Path, strict_validation: bool) -> TestHarness {
    let mut config = ChampionConfig::default();
    config.lake_base = root.join("lake");
    config.state_dir = root.join("state");
    config.quarantine_dir = root.join("quarantine");
    config.validation.fail_on_errors = strict_validation;
    let config = Arc::new(config);

    let transport = Arc::new(ScriptedTransport::new());
    let fetcher = Arc::new(Fetcher::new(
        transport.clone(),
        CircuitBreaker::new(&config.circuit_breaker),
        config.http.retries,
        root.join("downloads"),
    )
    .with_base_delay(std::time::Duration::from_millis(1)));

    let warehouse = Arc::new(MemoryWarehouse::default());
    let loader = Arc::new(
        Loader::new(warehouse.clone(), MarkerStore::new(&config.state_dir)).with_verification(),
    );

    let pipeline = Arc::new(Pipeline {
        fetcher,
        validator: Arc::new(Validator::new(
            config.validation.clone(),
            &config.quarantine_dir,
        )),
        lake: Arc::new(Lake::new(&config.lake_base)),
        loader,
        calendar: None,
        normalize: NormalizeOptions::default(),
        compression: Compression::Snappy,
    });

    let ctx = TaskContext::new(config.clone());
    TestHarness {
        pipeline,
        transport,
        warehouse,
        ctx,
        config,
    }
}

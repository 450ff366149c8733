//! Trade journal - append-only storage for trades, signals and portfolio snapshots
//!
//! The engine writes through [`TradeJournal`] on a best-effort basis: a
//! failed append is logged and the cycle carries on. [`CsvJournal`] keeps one
//! file per record type per day under the data directory.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::info;

use crate::coordinator::{ClosedTrade, PortfolioState};
use crate::types::Signal;

/// Closed trade row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub symbol: String,
    pub exchange: String,
    pub side: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    /// Entry plus exit fee
    pub fee: f64,
    pub opened_at: i64,
    pub closed_at: i64,
    pub exit_reason: String,
    pub paper: bool,
}

impl TradeRecord {
    pub fn from_closed(trade: &ClosedTrade, paper: bool) -> Self {
        let p = &trade.position;
        Self {
            id: p.id.clone(),
            symbol: p.symbol.to_string(),
            exchange: p.exchange.clone(),
            side: p.side.to_string(),
            quantity: p.quantity,
            entry_price: p.entry_price,
            exit_price: trade.exit_price,
            pnl: trade.realised_pnl,
            fee: p.entry_fee + trade.exit_fee,
            opened_at: p.opened_at.timestamp_millis(),
            closed_at: trade.closed_at.timestamp_millis(),
            exit_reason: trade.reason.to_string(),
            paper,
        }
    }
}

/// Signal row, written for every evaluated symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub timestamp: i64,
    pub symbol: String,
    pub strategy: String,
    pub direction: String,
    pub confidence: f64,
    pub price: f64,
    /// A position was opened from this signal
    pub executed: bool,
    #[serde(default)]
    pub low_confidence: bool,
    /// Indicator values as a JSON object
    pub indicators: String,
}

impl SignalRecord {
    pub fn from_signal(signal: &Signal, price: f64, executed: bool, low_confidence: bool) -> Self {
        Self {
            timestamp: signal.generated_at.timestamp_millis(),
            symbol: signal.symbol.to_string(),
            strategy: signal.strategy_id.clone(),
            direction: signal.direction.to_string(),
            confidence: signal.confidence,
            price,
            executed,
            low_confidence,
            indicators: serde_json::to_string(&signal.indicators).unwrap_or_default(),
        }
    }
}

/// Portfolio snapshot row, one per cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshotRecord {
    pub timestamp: i64,
    pub total_value: f64,
    pub available_capital: f64,
    pub capital_at_risk: f64,
    pub open_positions: usize,
    pub realised_pnl: f64,
    pub drawdown: f64,
    pub paper: bool,
}

impl PortfolioSnapshotRecord {
    pub fn from_state(state: &PortfolioState, paper: bool) -> Self {
        Self {
            timestamp: state.timestamp.timestamp_millis(),
            total_value: state.total_value,
            available_capital: state.available_capital,
            capital_at_risk: state.capital_at_risk,
            open_positions: state.open_positions,
            realised_pnl: state.realised_pnl,
            drawdown: state.drawdown,
            paper,
        }
    }
}

/// Append-only sink for trading history
#[async_trait]
pub trait TradeJournal: Send + Sync {
    async fn append_trade(&self, record: &TradeRecord) -> Result<()>;

    async fn append_signal(&self, record: &SignalRecord) -> Result<()>;

    async fn append_portfolio_snapshot(&self, record: &PortfolioSnapshotRecord) -> Result<()>;
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJournal;

#[async_trait]
impl TradeJournal for NullJournal {
    async fn append_trade(&self, _record: &TradeRecord) -> Result<()> {
        Ok(())
    }

    async fn append_signal(&self, _record: &SignalRecord) -> Result<()> {
        Ok(())
    }

    async fn append_portfolio_snapshot(&self, _record: &PortfolioSnapshotRecord) -> Result<()> {
        Ok(())
    }
}

/// Writer for `<dir>/<prefix>_<date>.csv` that rolls over at midnight UTC
struct DailyWriter {
    dir: PathBuf,
    prefix: &'static str,
    date: NaiveDate,
    writer: csv::Writer<fs::File>,
}

impl DailyWriter {
    fn open(dir: &Path, prefix: &'static str, date: NaiveDate) -> Result<Self> {
        let filename = daily_filename(prefix, date);
        Ok(Self {
            dir: dir.to_path_buf(),
            prefix,
            date,
            writer: create_writer(dir, &filename)?,
        })
    }

    fn append<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let today = Utc::now().date_naive();
        if today != self.date {
            *self = Self::open(&self.dir, self.prefix, today)?;
        }
        self.writer
            .serialize(record)
            .with_context(|| format!("Failed to write {} record", self.prefix))?;
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush {} writer", self.prefix))?;
        Ok(())
    }
}

fn daily_filename(prefix: &str, date: NaiveDate) -> String {
    format!("{}_{}.csv", prefix, date.format("%Y-%m-%d"))
}

/// Open for append, writing headers only when the file is new or empty
fn create_writer(dir: &Path, filename: &str) -> Result<csv::Writer<fs::File>> {
    let path = dir.join(filename);
    let file_has_data =
        path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open CSV file {}", path.display()))?;

    Ok(WriterBuilder::new()
        .has_headers(!file_has_data)
        .from_writer(file))
}

/// CSV journal under `data_dir/{trades,signals,portfolio}`
pub struct CsvJournal {
    data_dir: PathBuf,
    trade_writer: Arc<AsyncRwLock<DailyWriter>>,
    signal_writer: Arc<AsyncRwLock<DailyWriter>>,
    portfolio_writer: Arc<AsyncRwLock<DailyWriter>>,
}

impl CsvJournal {
    pub fn new(data_dir: &str) -> Result<Self> {
        let data_dir = PathBuf::from(data_dir);
        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        for sub in ["trades", "signals", "portfolio"] {
            fs::create_dir_all(data_dir.join(sub))
                .with_context(|| format!("Failed to create {} directory", sub))?;
        }

        let today = Utc::now().date_naive();
        let trade_writer = DailyWriter::open(&data_dir.join("trades"), "trades", today)?;
        let signal_writer = DailyWriter::open(&data_dir.join("signals"), "signals", today)?;
        let portfolio_writer =
            DailyWriter::open(&data_dir.join("portfolio"), "portfolio", today)?;

        info!(data_dir = %data_dir.display(), "CSV journal ready");

        Ok(Self {
            data_dir,
            trade_writer: Arc::new(AsyncRwLock::new(trade_writer)),
            signal_writer: Arc::new(AsyncRwLock::new(signal_writer)),
            portfolio_writer: Arc::new(AsyncRwLock::new(portfolio_writer)),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Trades from the last `days` daily files, oldest close first
    pub fn load_trades(&self, days: u32) -> Result<Vec<TradeRecord>> {
        let mut records: Vec<TradeRecord> = self.load_daily("trades", days)?;
        records.sort_by_key(|r| r.closed_at);
        Ok(records)
    }

    /// Signals from the last `days` daily files, oldest first
    pub fn load_signals(&self, days: u32) -> Result<Vec<SignalRecord>> {
        let mut records: Vec<SignalRecord> = self.load_daily("signals", days)?;
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    fn load_daily<T>(&self, kind: &'static str, days: u32) -> Result<Vec<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let mut records = Vec::new();
        let today = Utc::now().date_naive();

        for i in 0..days {
            let date = today - chrono::Duration::days(i as i64);
            let path = self.data_dir.join(kind).join(daily_filename(kind, date));
            if !path.exists() {
                continue;
            }
            let file = fs::File::open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
            for result in reader.deserialize() {
                let record: T =
                    result.with_context(|| format!("Failed to deserialize {} record", kind))?;
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl TradeJournal for CsvJournal {
    async fn append_trade(&self, record: &TradeRecord) -> Result<()> {
        self.trade_writer.write().await.append(record)
    }

    async fn append_signal(&self, record: &SignalRecord) -> Result<()> {
        self.signal_writer.write().await.append(record)
    }

    async fn append_portfolio_snapshot(&self, record: &PortfolioSnapshotRecord) -> Result<()> {
        self.portfolio_writer.write().await.append(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_data_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "rankbot_journal_{}_{}",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    fn make_trade(id: &str, closed_at: i64) -> TradeRecord {
        TradeRecord {
            id: id.to_string(),
            symbol: "BTC/USDT".to_string(),
            exchange: "binance".to_string(),
            side: "BUY".to_string(),
            quantity: 0.02,
            entry_price: 50_000.0,
            exit_price: 51_000.0,
            pnl: 17.98,
            fee: 2.02,
            opened_at: closed_at - 60_000,
            closed_at,
            exit_reason: "TAKE_PROFIT".to_string(),
            paper: true,
        }
    }

    #[tokio::test]
    async fn test_trades_round_trip() {
        let data_dir = temp_data_dir("trades");
        let journal = CsvJournal::new(data_dir.to_str().unwrap()).unwrap();

        journal.append_trade(&make_trade("pos-2", 2_000)).await.unwrap();
        journal.append_trade(&make_trade("pos-1", 1_000)).await.unwrap();

        let loaded = journal.load_trades(1).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], make_trade("pos-1", 1_000));
        assert_eq!(loaded[1].id, "pos-2");

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[tokio::test]
    async fn test_header_written_once_across_reopen() {
        let data_dir = temp_data_dir("reopen");
        {
            let journal = CsvJournal::new(data_dir.to_str().unwrap()).unwrap();
            journal.append_trade(&make_trade("pos-1", 1_000)).await.unwrap();
        }
        let journal = CsvJournal::new(data_dir.to_str().unwrap()).unwrap();
        journal.append_trade(&make_trade("pos-2", 2_000)).await.unwrap();

        let path = data_dir
            .join("trades")
            .join(daily_filename("trades", Utc::now().date_naive()));
        let content = fs::read_to_string(path).unwrap();
        let headers = content.lines().filter(|l| l.starts_with("id,")).count();
        assert_eq!(headers, 1);
        assert_eq!(journal.load_trades(1).unwrap().len(), 2);

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[test]
    fn test_headers_added_when_file_exists_but_is_empty() {
        let data_dir = temp_data_dir("empty");
        let signals_dir = data_dir.join("signals");
        fs::create_dir_all(&signals_dir).unwrap();
        let signal_file = signals_dir.join(daily_filename("signals", Utc::now().date_naive()));
        fs::write(&signal_file, "").unwrap();

        let journal = CsvJournal::new(data_dir.to_str().unwrap()).unwrap();
        let record = SignalRecord {
            timestamp: 1,
            symbol: "ETH/USDT".to_string(),
            strategy: "rsi".to_string(),
            direction: "BUY".to_string(),
            confidence: 0.7,
            price: 3500.0,
            executed: false,
            low_confidence: false,
            indicators: "{\"rsi\":15.0}".to_string(),
        };
        tokio_test::block_on(journal.append_signal(&record)).unwrap();

        let content = fs::read_to_string(&signal_file).unwrap();
        let mut lines = content.lines();
        let header = lines.next().unwrap_or_default();
        assert!(
            header.starts_with("timestamp,symbol,strategy,direction,confidence,price"),
            "unexpected header line: {}",
            header
        );
        assert!(lines.next().is_some(), "expected one data row after header");
        assert_eq!(journal.load_signals(1).unwrap(), vec![record]);

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[tokio::test]
    async fn test_null_journal_accepts_everything() {
        let journal = NullJournal;
        assert!(journal.append_trade(&make_trade("x", 1)).await.is_ok());
    }
}

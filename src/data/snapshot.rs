use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Latest observed price for one instrument. Gauge semantics: overwritten,
/// never appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub instrument_id: String,
    pub price: f64,
    pub change: f64,
    pub change_pct: f64,
    pub volume: u64,
    pub as_of: DateTime<Utc>,
}

/// The external data-store collaborator consulted when the upstream bridge has
/// no live price.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn snapshot(&self, instrument_id: &str) -> Result<Option<PriceSnapshot>>;
}

#[derive(Debug, Clone)]
struct DailyBar {
    date: String,
    close: f64,
    volume: u64,
}

impl DailyBar {
    fn from_csv_line(line: &str, line_num: usize) -> std::result::Result<Self, String> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();

        if fields.len() != 6 {
            return Err(format!(
                "Invalid CSV format at line {}: expected 6 fields, got {}",
                line_num + 1,
                fields.len()
            ));
        }

        Ok(DailyBar {
            date: fields[0].to_string(),
            close: fields[4]
                .parse()
                .map_err(|e| format!("Invalid close price at line {}: {}", line_num + 1, e))?,
            volume: fields[5]
                .parse::<f64>()
                .map(|v| v.max(0.0) as u64)
                .map_err(|e| format!("Invalid volume at line {}: {}", line_num + 1, e))?,
        })
    }

    fn as_of(&self) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&self.date)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(&self.date, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|naive| Utc.from_utc_datetime(&naive))
            })
            .unwrap_or_else(Utc::now)
    }
}

/// Snapshot store backed by one `<SYMBOL>.csv` file per instrument
/// (`date,open,high,low,close,volume`, oldest row first).
pub struct CsvSnapshotStore {
    snapshots: RwLock<HashMap<String, PriceSnapshot>>,
}

impl CsvSnapshotStore {
    pub fn empty() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Loads every CSV in `data_dir`. A missing directory yields an empty store.
    pub fn load(data_dir: &str) -> Self {
        let store = Self::empty();
        match store.reload(data_dir) {
            Ok(count) => info!("Snapshot store loaded {} instruments from {}", count, data_dir),
            Err(e) => warn!("Snapshot store starting empty, could not read {}: {}", data_dir, e),
        }
        store
    }

    pub fn reload(&self, data_dir: &str) -> Result<usize> {
        let mut loaded = HashMap::new();

        for entry in std::fs::read_dir(data_dir)? {
            let path = entry?.path();

            if path.extension() != Some(std::ffi::OsStr::new("csv")) {
                continue;
            }
            let Some(symbol) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let symbol = symbol.to_ascii_uppercase();

            match Self::load_from_csv(&path, &symbol) {
                Ok(Some(snapshot)) => {
                    loaded.insert(symbol, snapshot);
                }
                Ok(None) => warn!("No usable rows for symbol {}", symbol),
                Err(e) => error!("Failed to load data for symbol {}: {}", symbol, e),
            }
        }

        let count = loaded.len();
        *self
            .snapshots
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = loaded;
        Ok(count)
    }

    fn load_from_csv(path: &Path, symbol: &str) -> Result<Option<PriceSnapshot>> {
        let reader = BufReader::new(File::open(path)?);
        let mut previous: Option<DailyBar> = None;
        let mut latest: Option<DailyBar> = None;
        let mut errors = 0usize;

        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() || (line_num == 0 && line.to_ascii_lowercase().starts_with("date")) {
                continue;
            }

            match DailyBar::from_csv_line(&line, line_num) {
                Ok(bar) => {
                    previous = latest.take();
                    latest = Some(bar);
                }
                Err(e) => {
                    warn!("{}: {}", symbol, e);
                    errors += 1;
                }
            }
        }

        if errors > 0 {
            warn!("Loaded {} with {} malformed rows skipped", symbol, errors);
        }

        Ok(latest.map(|bar| Self::to_snapshot(symbol, &bar, previous.as_ref())))
    }

    fn to_snapshot(symbol: &str, bar: &DailyBar, previous: Option<&DailyBar>) -> PriceSnapshot {
        let (change, change_pct) = match previous {
            Some(prev) if prev.close != 0.0 => {
                let change = bar.close - prev.close;
                (change, change / prev.close * 100.0)
            }
            _ => (0.0, 0.0),
        };

        PriceSnapshot {
            instrument_id: symbol.to_string(),
            price: bar.close,
            change,
            change_pct,
            volume: bar.volume,
            as_of: bar.as_of(),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.snapshots
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl SnapshotStore for CsvSnapshotStore {
    async fn snapshot(&self, instrument_id: &str) -> Result<Option<PriceSnapshot>> {
        Ok(self
            .snapshots
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(instrument_id)
            .cloned())
    }
}

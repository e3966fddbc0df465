//! Bar CSV feed — lazy, row-at-a-time historical input.
//!
//! Expected format (header required, unknown columns ignored):
//!
//! ```text
//! datetime,open,high,low,close,volume
//! 2024-01-01T00:00:00+00:00,42000.00,42100.00,41950.00,42050.00,12.345
//! ```
//!
//! `datetime` must carry an explicit offset and marks the bar open; the
//! emitted event is stamped one period later, at the bar close. A naive
//! datetime or malformed row is a hard error: the source logs it with row
//! context and terminates.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

use crate::event::{Bar, BarError, BarEvent, Event};
use crate::pair::Pair;
use crate::source::{EventSource, Producer};

#[derive(Debug, Error)]
pub enum CsvBarError {
    #[error("row {row}: missing column `{column}`")]
    MissingColumn { row: u64, column: &'static str },

    #[error("row {row}: invalid datetime `{value}` (explicit offset required)")]
    InvalidDatetime { row: u64, value: String },

    #[error("row {row}: invalid decimal in `{column}`: `{value}`")]
    InvalidDecimal { row: u64, column: &'static str, value: String },

    #[error("row {row}: {source}")]
    InvalidBar {
        row: u64,
        #[source]
        source: BarError,
    },

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A parsed bar row, still stamped at the bar open.
#[derive(Debug, Clone, PartialEq)]
pub struct BarRow {
    pub datetime: DateTime<Utc>,
    pub bar: Bar,
}

/// Column indices resolved from the header once per file.
#[derive(Debug, Clone, Copy)]
struct Columns {
    datetime: usize,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    volume: usize,
}

impl Columns {
    fn resolve(headers: &csv::StringRecord) -> Result<Self, CsvBarError> {
        let find = |name: &'static str| {
            headers
                .iter()
                .position(|header| header.eq_ignore_ascii_case(name))
                .ok_or(CsvBarError::MissingColumn { row: 1, column: name })
        };
        Ok(Self {
            datetime: find("datetime")?,
            open: find("open")?,
            high: find("high")?,
            low: find("low")?,
            close: find("close")?,
            volume: find("volume")?,
        })
    }
}

/// Parse one record into a [`BarRow`].
fn parse_row(columns: Columns, record: &csv::StringRecord, row: u64) -> Result<BarRow, CsvBarError> {
    let field = |index: usize, column: &'static str| {
        record.get(index).ok_or(CsvBarError::MissingColumn { row, column })
    };
    let decimal = |index: usize, column: &'static str| -> Result<Decimal, CsvBarError> {
        let value = field(index, column)?;
        Decimal::from_str(value.trim()).map_err(|_| CsvBarError::InvalidDecimal {
            row,
            column,
            value: value.to_string(),
        })
    };

    let raw = field(columns.datetime, "datetime")?;
    let datetime = DateTime::parse_from_rfc3339(raw.trim())
        .map_err(|_| CsvBarError::InvalidDatetime { row, value: raw.to_string() })?
        .with_timezone(&Utc);

    let bar = Bar::new(
        decimal(columns.open, "open")?,
        decimal(columns.high, "high")?,
        decimal(columns.low, "low")?,
        decimal(columns.close, "close")?,
        decimal(columns.volume, "volume")?,
    )
    .map_err(|source| CsvBarError::InvalidBar { row, source })?;

    Ok(BarRow { datetime, bar })
}

/// Re-emit a row in normalized form: RFC 3339 datetime, normalized decimals.
/// Parsing the output yields the same [`BarRow`].
pub fn format_row(row: &BarRow) -> String {
    format!(
        "{},{},{},{},{},{}",
        row.datetime.to_rfc3339(),
        row.bar.open.normalize(),
        row.bar.high.normalize(),
        row.bar.low.normalize(),
        row.bar.close.normalize(),
        row.bar.volume.normalize(),
    )
}

/// Lazy bar source reading one CSV row per pop.
pub struct CsvBarSource {
    pair: Pair,
    period: Duration,
    reader: csv::StringRecordsIntoIter<Box<dyn Read + Send>>,
    columns: Option<Columns>,
    next: Option<Event>,
    row: u64,
    done: bool,
}

impl CsvBarSource {
    pub fn open(pair: Pair, period: Duration, path: impl AsRef<Path>) -> Result<Self, CsvBarError> {
        let file = File::open(path)?;
        Ok(Self::from_reader(pair, period, Box::new(file)))
    }

    pub fn from_reader(pair: Pair, period: Duration, input: Box<dyn Read + Send>) -> Self {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(input)
            .into_records();
        Self { pair, period, reader, columns: None, next: None, row: 1, done: false }
    }

    /// Read forward until an event is buffered or the input ends. A bad row
    /// terminates the source loudly rather than skipping data.
    fn fill(&mut self) {
        if self.next.is_some() || self.done {
            return;
        }
        match self.read_row() {
            Ok(Some(row)) => {
                let close = row.datetime + self.period;
                let event = BarEvent { pair: self.pair.clone(), period: self.period, bar: row.bar }
                    .into_event(close);
                self.next = Some(event);
            }
            Ok(None) => self.done = true,
            Err(err) => {
                error!(pair = %self.pair, error = %err, "bar csv source failed; terminating feed");
                self.done = true;
            }
        }
    }

    fn read_row(&mut self) -> Result<Option<BarRow>, CsvBarError> {
        let record = match self.reader.next() {
            Some(record) => record?,
            None => return Ok(None),
        };
        self.row += 1;

        let columns = match self.columns {
            Some(columns) => columns,
            None => {
                let headers = self.reader.reader_mut().headers()?.clone();
                let columns = Columns::resolve(&headers)?;
                self.columns = Some(columns);
                columns
            }
        };
        parse_row(columns, &record, self.row).map(Some)
    }
}

impl EventSource for CsvBarSource {
    fn peek_when(&mut self) -> Option<DateTime<Utc>> {
        self.fill();
        self.next.as_ref().map(|event| event.when)
    }

    fn pop(&mut self) -> Option<Event> {
        self.fill();
        self.next.take()
    }

    fn is_terminated(&self) -> bool {
        self.done && self.next.is_none()
    }

    fn producer(&self) -> Option<Arc<dyn Producer>> {
        None
    }
}

/// Parse a single normalized row; exposed for the round-trip property and
/// for callers that stage their own records.
pub fn parse_line(line: &str, row: u64) -> Result<BarRow, CsvBarError> {
    let record: csv::StringRecord = line.split(',').map(str::trim).collect();
    let columns = Columns {
        datetime: 0,
        open: 1,
        high: 2,
        low: 3,
        close: 4,
        volume: 5,
    };
    parse_row(columns, &record, row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::io::Cursor;

    fn source_from(data: &str) -> CsvBarSource {
        CsvBarSource::from_reader(
            Pair::new("BTC", "USDT"),
            Duration::hours(1),
            Box::new(Cursor::new(data.to_string())),
        )
    }

    const WELL_FORMED: &str = "\
datetime,open,high,low,close,volume
2024-01-01T00:00:00+00:00,42000.00,42100.00,41950.00,42050.00,12.345
2024-01-01T01:00:00+00:00,42050.00,42200.00,42000.00,42150.00,8.5
";

    #[test]
    fn events_fire_at_bar_close() {
        let mut source = source_from(WELL_FORMED);

        let first = source.pop().unwrap();
        assert_eq!(first.when, Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap());
        let bar = &first.bar_event().unwrap().bar;
        assert_eq!(bar.open, dec!(42000.00));
        assert_eq!(bar.volume, dec!(12.345));

        let second = source.pop().unwrap();
        assert_eq!(second.when, Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap());

        assert!(source.pop().is_none());
        assert!(source.is_terminated());
    }

    #[test]
    fn unknown_columns_are_ignored() {
        let data = "\
datetime,open,high,low,close,volume,vwap
2024-01-01T00:00:00+00:00,100,110,90,105,10,101.3
";
        let mut source = source_from(data);
        let event = source.pop().unwrap();
        assert_eq!(event.bar_event().unwrap().bar.close, dec!(105));
    }

    #[test]
    fn naive_datetime_terminates_the_source() {
        let data = "\
datetime,open,high,low,close,volume
2024-01-01T00:00:00,100,110,90,105,10
";
        let mut source = source_from(data);
        assert!(source.peek_when().is_none());
        assert!(source.is_terminated());
    }

    #[test]
    fn non_utc_offsets_are_converted() {
        let data = "\
datetime,open,high,low,close,volume
2024-01-01T02:00:00+02:00,100,110,90,105,10
";
        let mut source = source_from(data);
        let event = source.pop().unwrap();
        // 02:00+02:00 is midnight UTC; event lands at bar close 01:00 UTC.
        assert_eq!(event.when, Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap());
    }

    #[test]
    fn parse_then_format_is_idempotent_on_normalized_form() {
        let line = "2024-01-01T00:00:00+00:00,42000.00,42100.00,41950.00,42050.00,12.345";
        let parsed = parse_line(line, 2).unwrap();
        let normalized = format_row(&parsed);
        let reparsed = parse_line(&normalized, 2).unwrap();
        assert_eq!(parsed, reparsed);
        assert_eq!(format_row(&reparsed), normalized);
    }

    #[test]
    fn opens_files_from_disk() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(WELL_FORMED.as_bytes()).unwrap();

        let mut source = CsvBarSource::open(
            Pair::new("BTC", "USDT"),
            Duration::hours(1),
            file.path(),
        )
        .unwrap();

        let mut count = 0;
        while source.pop().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn missing_column_is_an_error() {
        let data = "\
datetime,open,high,low,close
2024-01-01T00:00:00+00:00,100,110,90,105
";
        let mut source = source_from(data);
        assert!(source.pop().is_none());
        assert!(source.is_terminated());
    }
}

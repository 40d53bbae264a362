//! Chunked reader for delimited dataset files
//!
//! Rows are pulled from disk `chunk_size` at a time, so memory stays
//! proportional to the chunk rather than to the file. The header row
//! becomes the declared column set, shared by every [`RawRecord`].

use crate::error::SourceError;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default number of rows read from disk at a time
pub const DEFAULT_CHUNK_SIZE: usize = 5_000;

/// How a dataset file is laid out
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub delimiter: u8,
    /// Honor double quotes; the OpenFoodFacts export has stray quotes inside fields
    pub quoting: bool,
    /// Non-data preamble lines before the header row
    pub skip_rows: usize,
    pub chunk_size: usize,
    /// Stop after this many data rows
    pub max_rows: Option<u64>,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quoting: true,
            skip_rows: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_rows: None,
        }
    }
}

impl SourceOptions {
    pub fn csv() -> Self {
        Self::default()
    }

    pub fn tsv() -> Self {
        Self {
            delimiter: b'\t',
            quoting: false,
            ..Self::default()
        }
    }

    pub fn skip_rows(mut self, rows: usize) -> Self {
        self.skip_rows = rows;
        self
    }

    pub fn chunk_size(mut self, rows: usize) -> Self {
        self.chunk_size = rows.max(1);
        self
    }

    pub fn max_rows(mut self, rows: Option<u64>) -> Self {
        self.max_rows = rows;
        self
    }
}

/// Declared column set of a source
#[derive(Debug, Default)]
pub struct Columns {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl Columns {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(|n| n.into().trim().to_string()).collect();
        let mut index = HashMap::with_capacity(names.len());
        for (position, name) in names.iter().enumerate() {
            index.entry(name.clone()).or_insert(position);
        }
        Self { names, index }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Entries of `required` that are not declared
    pub fn missing(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|name| !self.contains(name))
            .map(|name| (*name).to_string())
            .collect()
    }
}

/// One data row, addressed by column name
#[derive(Debug, Clone)]
pub struct RawRecord {
    columns: Arc<Columns>,
    values: csv::StringRecord,
    line: u64,
}

impl RawRecord {
    /// Build a record from `(column, value)` pairs
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let columns = Columns::new(pairs.iter().map(|(name, _)| *name));
        let values = csv::StringRecord::from(pairs.iter().map(|(_, value)| *value).collect::<Vec<_>>());
        Self {
            columns: Arc::new(columns),
            values,
            line: 0,
        }
    }

    /// Build a record from owned `(column, value)` entries found at `line`
    pub fn from_entries(entries: Vec<(String, String)>, line: u64) -> Self {
        let (names, values): (Vec<String>, Vec<String>) = entries.into_iter().unzip();
        Self {
            columns: Arc::new(Columns::new(names)),
            values: csv::StringRecord::from(values),
            line,
        }
    }

    /// Raw value of `column`; `None` when the column is not declared or the row is short
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns.position(column).and_then(|i| self.values.get(i))
    }

    /// 1-based line in the file
    pub fn line(&self) -> u64 {
        self.line
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns.names().iter().map(String::as_str).zip(self.values.iter())
    }
}

/// Anything the pipeline can read rows from
pub trait RecordSource: Iterator<Item = Result<RawRecord, SourceError>> + Send + 'static {
    /// Columns declared by the underlying file
    fn declared(&self) -> &Columns;

    /// Stop yielding rows once `token` is cancelled
    fn stop_on(&mut self, token: CancellationToken);

    /// Fail with [`SourceError::MissingColumns`] unless every name in `required` is declared
    fn check_columns(&self, required: &[&str]) -> Result<(), SourceError> {
        let missing = self.declared().missing(required);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SourceError::MissingColumns(missing))
        }
    }
}

/// Lazily yields the rows of one delimited file, in file order.
///
/// Not restartable: open a new source to scan the file again.
pub struct CsvSource<R: Read> {
    reader: csv::Reader<BufReader<R>>,
    columns: Arc<Columns>,
    options: SourceOptions,
    buffer: VecDeque<Result<RawRecord, SourceError>>,
    rows_read: u64,
    exhausted: bool,
    stop: Option<CancellationToken>,
}

impl CsvSource<File> {
    pub fn open(path: impl AsRef<Path>, options: SourceOptions) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), delimiter = %char::from(options.delimiter).escape_default(), "Opened source");
        Self::from_reader(file, options)
    }
}

impl<R: Read> CsvSource<R> {
    /// Skip the preamble and read the header row of `input`
    pub fn from_reader(input: R, options: SourceOptions) -> Result<Self, SourceError> {
        let mut input = BufReader::new(input);
        let mut discard = Vec::new();
        for _ in 0..options.skip_rows {
            discard.clear();
            if input.read_until(b'\n', &mut discard)? == 0 {
                break;
            }
        }

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(options.delimiter)
            .quoting(options.quoting)
            .has_headers(true)
            .flexible(true)
            .from_reader(input);

        let header = reader.headers()?;
        if header.is_empty() || header.iter().all(|h| h.trim().is_empty()) {
            return Err(SourceError::NoHeader);
        }
        let columns = Arc::new(Columns::new(header.iter()));

        Ok(Self {
            reader,
            columns,
            options,
            buffer: VecDeque::new(),
            rows_read: 0,
            exhausted: false,
            stop: None,
        })
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    /// Fail with [`SourceError::MissingColumns`] unless every name in `required` is declared
    pub fn require(&self, required: &[&str]) -> Result<(), SourceError> {
        let missing = self.columns.missing(required);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SourceError::MissingColumns(missing))
        }
    }

    /// Fold consecutive rows sharing `key` into one record per key.
    ///
    /// See [`PivotRows`].
    pub fn pivot(self, key: &str, name: &str, value: &str) -> PivotRows<R> {
        PivotRows {
            rows: self,
            key: key.to_string(),
            name: name.to_string(),
            value: value.to_string(),
            open: None,
        }
    }

    /// Data rows read from disk so far
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    fn stopped(&self) -> bool {
        self.stop.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn fill(&mut self) {
        let mut budget = self.options.chunk_size.max(1) as u64;
        if let Some(max) = self.options.max_rows {
            budget = budget.min(max.saturating_sub(self.rows_read));
        }
        if budget == 0 {
            self.exhausted = true;
            return;
        }

        for _ in 0..budget {
            let mut values = csv::StringRecord::new();
            match self.reader.read_record(&mut values) {
                Ok(true) => {
                    self.rows_read += 1;
                    let line = values.position().map_or(self.rows_read, |p| p.line());
                    self.buffer.push_back(Ok(RawRecord {
                        columns: Arc::clone(&self.columns),
                        values,
                        line,
                    }));
                },
                Ok(false) => {
                    self.exhausted = true;
                    break;
                },
                Err(e) if e.is_io_error() => {
                    self.buffer.push_back(Err(SourceError::Read(e)));
                    self.exhausted = true;
                    break;
                },
                Err(e) => {
                    self.rows_read += 1;
                    let line = e.position().map_or(self.rows_read, |p| p.line());
                    self.buffer.push_back(Err(SourceError::Row {
                        line,
                        message: e.to_string(),
                    }));
                },
            }
        }

        if self.options.max_rows.is_some_and(|max| self.rows_read >= max) {
            self.exhausted = true;
        }
    }
}

impl<R: Read> Iterator for CsvSource<R> {
    type Item = Result<RawRecord, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped() {
            self.buffer.clear();
            return None;
        }
        if self.buffer.is_empty() && !self.exhausted {
            self.fill();
        }
        self.buffer.pop_front()
    }
}

impl<R: Read + Send + 'static> RecordSource for CsvSource<R> {
    fn declared(&self) -> &Columns {
        &self.columns
    }

    fn stop_on(&mut self, token: CancellationToken) {
        self.stop = Some(token);
    }
}

struct OpenGroup {
    key: String,
    line: u64,
    entries: Vec<(String, String)>,
}

/// Long-format rows (`key, name, value`) folded into one wide record per key.
///
/// Rows must be grouped by key, as in the FoodData Central nutrient export.
/// Each yielded record has the key column followed by one column per
/// `name`, holding its `value`. Rows with a blank key or name are ignored;
/// `max_rows` and the stop signal apply to the underlying rows.
pub struct PivotRows<R: Read> {
    rows: CsvSource<R>,
    key: String,
    name: String,
    value: String,
    open: Option<OpenGroup>,
}

impl<R: Read> PivotRows<R> {
    fn close(&mut self) -> Option<RawRecord> {
        let group = self.open.take()?;
        let mut entries = Vec::with_capacity(group.entries.len() + 1);
        entries.push((self.key.clone(), group.key));
        entries.extend(group.entries);
        Some(RawRecord::from_entries(entries, group.line))
    }
}

impl<R: Read> Iterator for PivotRows<R> {
    type Item = Result<RawRecord, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let raw = match self.rows.next() {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => return Some(Err(e)),
                None => return self.close().map(Ok),
            };

            let key = raw.get(&self.key).map(str::trim).unwrap_or_default();
            let name = raw.get(&self.name).map(str::trim).unwrap_or_default();
            if key.is_empty() || name.is_empty() {
                continue;
            }
            let value = raw.get(&self.value).unwrap_or_default().to_string();

            if let Some(group) = self.open.as_mut().filter(|group| group.key == key) {
                group.entries.push((name.to_string(), value));
                continue;
            }
            let finished = self.close();
            self.open = Some(OpenGroup {
                key: key.to_string(),
                line: raw.line(),
                entries: vec![(name.to_string(), value)],
            });
            if let Some(record) = finished {
                return Some(Ok(record));
            }
        }
    }
}

impl<R: Read + Send + 'static> RecordSource for PivotRows<R> {
    fn declared(&self) -> &Columns {
        &self.rows.columns
    }

    fn stop_on(&mut self, token: CancellationToken) {
        self.rows.stop_on(token);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn source(data: &str, options: SourceOptions) -> CsvSource<&[u8]> {
        CsvSource::from_reader(data.as_bytes(), options).unwrap()
    }

    #[test]
    fn test_reads_rows_in_order() {
        let rows: Vec<_> = source("Name,Calories\nApple,52\nPear,57\n", SourceOptions::csv())
            .map(Result::unwrap)
            .collect();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("Name"), Some("Apple"));
        assert_eq!(rows[1].get("Calories"), Some("57"));
        assert_eq!(rows[1].get("Protein"), None);
        assert_eq!(rows[0].line(), 2);
    }

    #[test]
    fn test_skips_preamble_rows() {
        let data = "MyFoodData export\nGenerated 2024\n\nID,Name\n1,Apple\n";
        let src = source(data, SourceOptions::csv().skip_rows(3));
        assert_eq!(src.columns().names(), ["ID", "Name"]);

        let rows: Vec<_> = src.map(Result::unwrap).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("ID"), Some("1"));
    }

    #[test]
    fn test_required_columns() {
        let src = source("code\tproduct_name\n1\tx\n", SourceOptions::tsv());
        assert!(src.require(&["code"]).is_ok());

        match src.require(&["code", "brands", "Name"]) {
            Err(SourceError::MissingColumns(missing)) => assert_eq!(missing, vec!["brands", "Name"]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_empty_file_has_no_header() {
        assert!(matches!(
            CsvSource::from_reader("".as_bytes(), SourceOptions::csv()),
            Err(SourceError::NoHeader)
        ));
    }

    #[test]
    fn test_max_rows_across_chunks() {
        let mut data = String::from("n\n");
        for i in 0..50 {
            data.push_str(&format!("{i}\n"));
        }
        let src = source(&data, SourceOptions::csv().chunk_size(7).max_rows(Some(20)));
        let rows: Vec<_> = src.map(Result::unwrap).collect();
        assert_eq!(rows.len(), 20);
        assert_eq!(rows[19].get("n"), Some("19"));
    }

    #[test]
    fn test_chunking_keeps_every_row() {
        let mut data = String::from("n\n");
        for i in 0..23 {
            data.push_str(&format!("{i}\n"));
        }
        let mut src = source(&data, SourceOptions::csv().chunk_size(5));
        let first = src.next().unwrap().unwrap();
        assert_eq!(first.get("n"), Some("0"));
        assert_eq!(src.rows_read(), 5);
        assert_eq!(src.count(), 22);
    }

    #[test]
    fn test_stop_signal_ends_iteration() {
        let token = CancellationToken::new();
        let mut src = source("n\n1\n2\n3\n", SourceOptions::csv());
        src.stop_on(token.clone());
        assert!(src.next().is_some());
        token.cancel();
        assert!(src.next().is_none());
    }

    #[test]
    fn test_invalid_utf8_is_row_level() {
        let mut bytes = b"Name\nApple\n".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe, b'\n']);
        bytes.extend_from_slice(b"Pear\n");

        let rows: Vec<_> = CsvSource::from_reader(bytes.as_slice(), SourceOptions::csv())
            .unwrap()
            .collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].is_ok());
        assert!(rows[1].as_ref().unwrap_err().is_row_level());
        assert_eq!(rows[2].as_ref().unwrap().get("Name"), Some("Pear"));
    }

    #[test]
    fn test_tsv_keeps_stray_quotes() {
        let rows: Vec<_> = source("code\tproduct_name\n1\t12\" pizza\n", SourceOptions::tsv())
            .map(Result::unwrap)
            .collect();
        assert_eq!(rows[0].get("product_name"), Some("12\" pizza"));
    }

    #[test]
    fn test_open_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Name,Calories").unwrap();
        writeln!(file, "Apple,52").unwrap();

        let src = CsvSource::open(file.path(), SourceOptions::csv()).unwrap();
        assert_eq!(src.count(), 1);

        assert!(matches!(
            CsvSource::open("/definitely/not/here.csv", SourceOptions::csv()),
            Err(SourceError::Open { .. })
        ));
    }

    #[test]
    fn test_pivot_folds_consecutive_keys() {
        let data = "id,fdc_id,nutrient_id,amount\n\
                    1,100,1008,52\n\
                    2,100,1003,0.3\n\
                    3,,1004,1\n\
                    4,200,1008,57\n";
        let rows: Vec<_> = source(data, SourceOptions::csv())
            .pivot("fdc_id", "nutrient_id", "amount")
            .map(Result::unwrap)
            .collect();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("fdc_id"), Some("100"));
        assert_eq!(rows[0].get("1008"), Some("52"));
        assert_eq!(rows[0].get("1003"), Some("0.3"));
        assert_eq!(rows[0].get("1004"), None);
        assert_eq!(rows[0].line(), 2);
        assert_eq!(rows[1].get("fdc_id"), Some("200"));
        assert_eq!(rows[1].iter().count(), 2);
    }

    #[test]
    fn test_pivot_keeps_declared_columns_and_stop_signal() {
        let token = CancellationToken::new();
        let mut rows = source("fdc_id,nutrient_id,amount\n1,1008,5\n2,1008,6\n3,1008,7\n", SourceOptions::csv())
            .pivot("fdc_id", "nutrient_id", "amount");
        rows.stop_on(token.clone());
        assert!(rows.check_columns(&["fdc_id", "amount"]).is_ok());
        assert!(rows.check_columns(&["description"]).is_err());

        assert_eq!(rows.next().unwrap().unwrap().get("fdc_id"), Some("1"));
        token.cancel();
        // The group still open when the source stops is emitted
        assert_eq!(rows.next().unwrap().unwrap().get("fdc_id"), Some("2"));
        assert!(rows.next().is_none());
    }

    #[test]
    fn test_raw_record_from_pairs() {
        let raw = RawRecord::from_pairs(&[("Name", "Apple"), ("Calories", "52")]);
        assert_eq!(raw.get("Calories"), Some("52"));
        let collected: Vec<_> = raw.iter().collect();
        assert_eq!(collected, vec![("Name", "Apple"), ("Calories", "52")]);
    }
}

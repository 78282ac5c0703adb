//! Chunked reader for delimited source files
//!
//! The reader validates the header when the file is opened and then yields
//! bounded batches lazily, so peak memory depends on the batch size and not
//! on the file size.

use std::fs::File;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use tracing::{debug, warn};

use crate::error::{IngestError, IngestResult};
use crate::record::SourceRecord;
use crate::schema::{Presence, TargetSchema};

/// One slice of the source file
#[derive(Debug, Clone)]
pub struct RawBatch {
    /// 1-based batch number
    pub index: usize,
    pub records: Vec<SourceRecord>,
    /// Row numbers that could not be decoded at all
    pub malformed: Vec<i64>,
}

impl RawBatch {
    /// Rows consumed from the source for this batch
    pub fn rows_read(&self) -> usize {
        self.records.len() + self.malformed.len()
    }
}

/// Lazy, finite, ordered sequence of [`RawBatch`]es over one file
pub struct ChunkedReader {
    path: PathBuf,
    reader: csv::Reader<File>,
    headers: StringRecord,
    batch_size: usize,
    limit: Option<u64>,
    rows_read: i64,
    batches: usize,
    finished: bool,
}

impl ChunkedReader {
    /// Open a comma separated file and read its header
    pub fn open(path: impl AsRef<Path>, batch_size: usize) -> IngestResult<Self> {
        Self::open_with_delimiter(path, batch_size, b',')
    }

    pub fn open_with_delimiter(
        path: impl AsRef<Path>,
        batch_size: usize,
        delimiter: u8,
    ) -> IngestResult<Self> {
        let path = path.as_ref().to_path_buf();

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            // Short rows read as absent fields, which normalise to null
            .flexible(true)
            .from_path(&path)
            .map_err(|source| IngestError::SourceOpen {
                path: path.clone(),
                source,
            })?;

        let headers = reader
            .headers()
            .map_err(|source| IngestError::SourceHeader {
                path: path.clone(),
                source,
            })?
            .clone();

        debug!(path = %path.display(), columns = headers.len(), batch_size, "Opened source file");

        Ok(Self {
            path,
            reader,
            headers,
            batch_size: batch_size.max(1),
            limit: None,
            rows_read: 0,
            batches: 0,
            finished: false,
        })
    }

    /// Stop after `limit` data rows
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    pub fn headers(&self) -> &StringRecord {
        &self.headers
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn limit_reached(&self) -> bool {
        self.limit
            .is_some_and(|limit| u64::try_from(self.rows_read).unwrap_or(u64::MAX) >= limit)
    }

    fn next_batch(&mut self) -> IngestResult<Option<RawBatch>> {
        if self.finished {
            return Ok(None);
        }

        let mut records = Vec::with_capacity(self.batch_size.min(64 * 1024));
        let mut malformed = Vec::new();

        while records.len() + malformed.len() < self.batch_size {
            if self.limit_reached() {
                self.finished = true;
                break;
            }

            let mut record = StringRecord::new();
            match self.reader.read_record(&mut record) {
                Ok(true) => {
                    self.rows_read += 1;
                    records.push(SourceRecord::new(self.rows_read, record));
                },
                Ok(false) => {
                    self.finished = true;
                    break;
                },
                Err(source) if source.is_io_error() => {
                    return Err(IngestError::SourceRead {
                        row: self.rows_read,
                        source,
                    });
                },
                Err(e) => {
                    self.rows_read += 1;
                    warn!(row = self.rows_read, error = %e, "Skipping undecodable row");
                    malformed.push(self.rows_read);
                },
            }
        }

        if records.is_empty() && malformed.is_empty() {
            return Ok(None);
        }

        self.batches += 1;
        Ok(Some(RawBatch {
            index: self.batches,
            records,
            malformed,
        }))
    }
}

impl Iterator for ChunkedReader {
    type Item = IngestResult<RawBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next_batch();
        if next.is_err() {
            // A failed read is final; do not keep pulling from a broken stream
            self.finished = true;
        }
        next.transpose()
    }
}

/// Where each schema column lives in the source header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    positions: Vec<Option<usize>>,
    synthesized: Vec<String>,
}

impl ColumnLayout {
    /// Match schema columns against the header.
    ///
    /// Missing optional columns are synthesised as null; missing required
    /// columns are a fatal error reported all at once.
    pub fn resolve(schema: &TargetSchema, headers: &StringRecord, path: &Path) -> IngestResult<Self> {
        let names: Vec<&str> = headers
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim())
            .collect();

        let mut positions = Vec::with_capacity(schema.columns.len());
        let mut synthesized = Vec::new();
        let mut missing = Vec::new();

        for column in &schema.columns {
            let position = names.iter().position(|h| *h == column.name);
            match (position, column.presence) {
                (None, Presence::Required) => missing.push(column.name.clone()),
                (None, Presence::Optional) => synthesized.push(column.name.clone()),
                _ => {},
            }
            positions.push(position);
        }

        if !missing.is_empty() {
            return Err(IngestError::MissingColumns {
                path: path.to_path_buf(),
                columns: missing,
            });
        }

        if !synthesized.is_empty() {
            warn!(
                target_schema = %schema.name,
                columns = ?synthesized,
                "Optional columns absent from source, loading them as null"
            );
        }

        Ok(Self {
            positions,
            synthesized,
        })
    }

    /// Header position of the i-th schema column
    pub fn position(&self, column: usize) -> Option<usize> {
        self.positions.get(column).copied().flatten()
    }

    pub fn synthesized(&self) -> &[String] {
        &self.synthesized
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_csv(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_batches_preserve_order_and_size() {
        let mut content = String::from("user_id,book_id,rating\n");
        for i in 1..=7 {
            content.push_str(&format!("{},{},3\n", i, i * 10));
        }
        let file = write_csv(&content);

        let batches: Vec<RawBatch> = ChunkedReader::open(file.path(), 3)
            .unwrap()
            .collect::<IngestResult<_>>()
            .unwrap();

        assert_eq!(batches.iter().map(|b| b.records.len()).collect::<Vec<_>>(), vec![3, 3, 1]);
        assert_eq!(batches.iter().map(|b| b.index).collect::<Vec<_>>(), vec![1, 2, 3]);

        let rows: Vec<i64> = batches.iter().flat_map(|b| b.records.iter().map(|r| r.row)).collect();
        assert_eq!(rows, (1..=7).collect::<Vec<_>>());
        assert_eq!(batches[2].records[0].get(0), Some("7"));
    }

    #[test]
    fn test_limit_stops_early() {
        let file = write_csv("user_id,book_id,rating\n1,1,1\n2,2,2\n3,3,3\n");
        let batches: Vec<RawBatch> = ChunkedReader::open(file.path(), 10)
            .unwrap()
            .with_limit(Some(2))
            .collect::<IngestResult<_>>()
            .unwrap();

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].records.len(), 2);
    }

    #[test]
    fn test_short_rows_are_tolerated() {
        let file = write_csv("user_id,book_id,rating\n1,2\n");
        let batch = ChunkedReader::open(file.path(), 10).unwrap().next().unwrap().unwrap();
        assert_eq!(batch.records[0].get(1), Some("2"));
        assert_eq!(batch.records[0].get(2), None);
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let result = ChunkedReader::open("/definitely/not/here.csv", 10);
        assert!(matches!(result, Err(IngestError::SourceOpen { .. })));
    }

    #[test]
    fn test_layout_synthesizes_optional_columns() {
        let schema = schema::books().unwrap();
        let names: Vec<&str> = schema
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .filter(|name| *name != "goodreads_book_id")
            .collect();
        let headers = StringRecord::from(names);
        let layout = ColumnLayout::resolve(&schema, &headers, Path::new("books.csv")).unwrap();

        assert_eq!(layout.position(0), Some(0));
        assert_eq!(layout.position(1), None);
        assert_eq!(layout.position(3), Some(2));
        assert_eq!(layout.synthesized(), &["goodreads_book_id".to_string()]);
    }

    #[test]
    fn test_identifiers_without_goodreads_id_are_refused() {
        let schema = schema::book_identifiers().unwrap();
        let headers = StringRecord::from(vec!["work_id", "book_id", "best_book_id"]);
        let err = ColumnLayout::resolve(&schema, &headers, Path::new("books.csv")).unwrap_err();

        match err {
            IngestError::MissingColumns { columns, .. } => {
                assert_eq!(columns, vec!["goodreads_book_id".to_string()]);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_layout_reports_every_missing_required_column() {
        let schema = schema::ratings(schema::Aggregation::Max).unwrap();
        let headers = StringRecord::from(vec!["user_id"]);
        let err = ColumnLayout::resolve(&schema, &headers, Path::new("ratings.csv")).unwrap_err();

        match err {
            IngestError::MissingColumns { columns, .. } => {
                assert_eq!(columns, vec!["book_id".to_string(), "rating".to_string()]);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_layout_ignores_bom_and_padding() {
        let schema = schema::ratings(schema::Aggregation::Max).unwrap();
        let headers = StringRecord::from(vec!["\u{feff}user_id", " book_id ", "rating"]);
        let layout = ColumnLayout::resolve(&schema, &headers, Path::new("ratings.csv")).unwrap();
        assert_eq!(layout.position(0), Some(0));
        assert_eq!(layout.position(1), Some(1));
    }
}

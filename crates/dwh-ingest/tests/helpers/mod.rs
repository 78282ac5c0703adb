//! Shared fixtures for ingest integration tests
//!
//! Source files are written to temporary files that disappear with the
//! returned handle, so keep it alive for the duration of the load.

#![allow(dead_code)]

use std::io::Write;
use std::time::Duration;

use dwh_ingest::record::Value;
use dwh_ingest::{LoadConfig, TargetSchema};
use tempfile::NamedTempFile;

pub const BOOKS_HEADER: &str = "book_id,goodreads_book_id,best_book_id,work_id,books_count,isbn,isbn13,authors,original_publication_year,original_title,title,language_code,average_rating,ratings_count,work_ratings_count,work_text_reviews_count";

pub const RATINGS_HEADER: &str = "user_id,book_id,rating";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,dwh_ingest=info")),
        )
        .with_test_writer()
        .try_init();
}

/// Load settings for tests: no retry delay
pub fn test_config() -> LoadConfig {
    LoadConfig {
        retry_backoff: Duration::ZERO,
        ..LoadConfig::default()
    }
}

pub fn write_bytes(content: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp file");
    file.write_all(content).expect("write fixture");
    file.flush().expect("flush fixture");
    file
}

pub fn write_csv(header: &str, lines: &[String]) -> NamedTempFile {
    let mut content = String::with_capacity(header.len() + lines.len() * 32);
    content.push_str(header);
    content.push('\n');
    for line in lines {
        content.push_str(line);
        content.push('\n');
    }
    write_bytes(content.as_bytes())
}

pub fn ratings_csv(rows: &[(i64, i64, i64)]) -> NamedTempFile {
    let lines: Vec<String> = rows
        .iter()
        .map(|(user, book, rating)| format!("{},{},{}", user, book, rating))
        .collect();
    write_csv(RATINGS_HEADER, &lines)
}

/// A complete books.csv line
pub fn book_line(book_id: i64, goodreads_book_id: i64, work_id: i64, title: &str) -> String {
    format!(
        "{book_id},{goodreads_book_id},{goodreads_book_id},{work_id},12,0439023483,9780439023480,Suzanne Collins,2008.0,,\"{title}\",eng,4.34,4780653,4942365,155254"
    )
}

pub fn books_csv(lines: &[String]) -> NamedTempFile {
    write_csv(BOOKS_HEADER, lines)
}

/// Value of a named column in a table row
pub fn column<'a>(schema: &TargetSchema, row: &'a [Value], name: &str) -> &'a Value {
    let index = schema.column_index(name).expect("known column");
    &row[index]
}

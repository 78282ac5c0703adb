//! Record normalizer: raw strings to typed values
//!
//! Every schema column gets a value. Integers are parsed from their decimal
//! text and never pass through `f64`, so large identifiers stay exact. Text
//! keeps its original spelling, except that missing-value tokens become a
//! real null.

use crate::reader::ColumnLayout;
use crate::record::{NormalizedRecord, RejectReason, SourceRecord, Value};
use crate::schema::{FieldKind, TargetSchema};

/// Tokens read as "no value", matching the pandas CSV reader defaults the
/// goodbooks exports were produced with.
pub const MISSING_TOKENS: &[&str] = &[
    "nan", "NaN", "-nan", "-NaN", "NA", "N/A", "n/a", "#N/A", "#NA", "NULL", "null", "None",
    "<NA>", "1.#IND", "1.#QNAN", "-1.#IND", "-1.#QNAN",
];

/// True when a raw field carries no value
pub fn is_missing(raw: &str) -> bool {
    let trimmed = raw.trim();
    trimmed.is_empty() || MISSING_TOKENS.contains(&trimmed)
}

/// Parse an exact integer.
///
/// Accepts an optional sign and an all-zero fractional part (`2008.0`), the
/// shape nullable integer columns take after a round trip through a float
/// column. Anything else, including exponent notation, is not an integer.
pub fn parse_integer(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if is_missing(trimmed) {
        return None;
    }

    let digits = match trimmed.split_once('.') {
        Some((whole, fraction)) if !fraction.is_empty() && fraction.bytes().all(|b| b == b'0') => {
            whole
        },
        Some(_) => return None,
        None => trimmed,
    };

    let unsigned = digits.strip_prefix(['+', '-']).unwrap_or(digits);
    if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    digits.parse::<i64>().ok()
}

/// Parse a finite float; NaN and infinities are missing values
pub fn parse_float(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if is_missing(trimmed) {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Keep text verbatim unless it is a missing token
pub fn normalize_text(raw: &str) -> Option<String> {
    if is_missing(raw) {
        None
    } else {
        Some(raw.to_string())
    }
}

/// Parse one raw field according to its semantic type
pub fn parse_value(kind: FieldKind, raw: Option<&str>) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };

    match kind {
        FieldKind::Integer => parse_integer(raw).map_or(Value::Null, Value::Int),
        FieldKind::Float => parse_float(raw).map_or(Value::Null, Value::Float),
        FieldKind::Text => normalize_text(raw).map_or(Value::Null, Value::Text),
    }
}

/// Normalizes source rows for one target schema
pub struct Normalizer<'a> {
    schema: &'a TargetSchema,
    layout: &'a ColumnLayout,
}

impl<'a> Normalizer<'a> {
    pub fn new(schema: &'a TargetSchema, layout: &'a ColumnLayout) -> Self {
        Self { schema, layout }
    }

    /// Type every schema column of one row.
    ///
    /// Fails only when a non-nullable column has no usable value; the caller
    /// counts the row as malformed and moves on.
    pub fn normalize(&self, record: &SourceRecord) -> Result<NormalizedRecord, RejectReason> {
        let mut values = Vec::with_capacity(self.schema.columns.len());

        for (i, column) in self.schema.columns.iter().enumerate() {
            let raw = self.layout.position(i).and_then(|pos| record.get(pos));
            let value = parse_value(column.kind, raw);

            if value.is_null() && !column.nullable {
                return Err(RejectReason::Malformed {
                    column: Some(column.name.clone()),
                });
            }
            values.push(value);
        }

        Ok(NormalizedRecord {
            row: record.row,
            values,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::{self, ColumnSpec, ConflictPolicy};
    use csv::StringRecord;
    use proptest::prelude::*;
    use std::path::Path;

    #[test]
    fn test_parse_integer() {
        assert_eq!(parse_integer("42"), Some(42));
        assert_eq!(parse_integer(" -7 "), Some(-7));
        assert_eq!(parse_integer("+3"), Some(3));
        assert_eq!(parse_integer("2008.0"), Some(2008));
        assert_eq!(parse_integer("2008.00"), Some(2008));
        assert_eq!(parse_integer("2008.5"), None);
        assert_eq!(parse_integer("2008."), None);
        assert_eq!(parse_integer("9.78043902348e+12"), None);
        assert_eq!(parse_integer("nan"), None);
        assert_eq!(parse_integer(""), None);
        assert_eq!(parse_integer("-"), None);
        assert_eq!(parse_integer("99999999999999999999"), None);
    }

    #[test]
    fn test_large_identifiers_stay_exact() {
        // 2^53 + 1 cannot survive a trip through f64
        assert_eq!(parse_integer("9007199254740993"), Some(9_007_199_254_740_993));
    }

    #[test]
    fn test_parse_float() {
        assert_eq!(parse_float("4.34"), Some(4.34));
        assert_eq!(parse_float("4"), Some(4.0));
        assert_eq!(parse_float("NaN"), None);
        assert_eq!(parse_float("inf"), None);
        assert_eq!(parse_float("abc"), None);
    }

    #[test]
    fn test_empty_and_nan_text_are_the_same_null() {
        let empty = parse_value(FieldKind::Text, Some(""));
        let blank = parse_value(FieldKind::Text, Some("   "));
        let nan = parse_value(FieldKind::Text, Some("nan"));
        let absent = parse_value(FieldKind::Text, None);

        assert_eq!(empty, Value::Null);
        assert_eq!(blank, Value::Null);
        assert_eq!(nan, Value::Null);
        assert_eq!(absent, Value::Null);
    }

    #[test]
    fn test_text_is_kept_verbatim() {
        assert_eq!(normalize_text("0439023483"), Some("0439023483".to_string()));
        assert_eq!(normalize_text(" The Hunger Games "), Some(" The Hunger Games ".to_string()));
        assert_eq!(normalize_text("nanny"), Some("nanny".to_string()));
    }

    #[test]
    fn test_normalize_books_row() {
        let schema = schema::books().unwrap();
        let headers = StringRecord::from(vec![
            "book_id",
            "best_book_id",
            "work_id",
            "books_count",
            "isbn",
            "isbn13",
            "authors",
            "original_publication_year",
            "original_title",
            "title",
            "language_code",
            "average_rating",
            "ratings_count",
            "work_ratings_count",
            "work_text_reviews_count",
        ]);
        let layout = ColumnLayout::resolve(&schema, &headers, Path::new("books.csv")).unwrap();
        let normalizer = Normalizer::new(&schema, &layout);

        let fields = StringRecord::from(vec![
            "1",
            "2767052",
            "2792775",
            "272",
            "439023483",
            "9780439023480",
            "Suzanne Collins",
            "2008.0",
            "",
            "The Hunger Games (The Hunger Games, #1)",
            "eng",
            "4.34",
            "4780653",
            "4942365",
            "155254",
        ]);
        let record = normalizer.normalize(&SourceRecord::new(1, fields)).unwrap();

        assert_eq!(record.values.len(), schema.columns.len());
        assert_eq!(record.values[0], Value::Int(1));
        assert_eq!(record.values[1], Value::Null); // synthesised goodreads_book_id
        assert_eq!(record.values[5], Value::Text("439023483".to_string()));
        assert_eq!(record.values[6], Value::Text("9780439023480".to_string()));
        assert_eq!(record.values[8], Value::Int(2008));
        assert_eq!(record.values[9], Value::Null);
        assert_eq!(record.values[12], Value::Float(4.34));
    }

    #[test]
    fn test_non_nullable_column_fails_the_row() {
        let schema = crate::schema::TargetSchema::new(
            "strict",
            "stg",
            "tgt",
            vec![ColumnSpec::integer("id").not_null(), ColumnSpec::text("name")],
            &["id"],
            ConflictPolicy::InsertIfAbsent,
        )
        .unwrap()
        .validate()
        .unwrap();
        let headers = StringRecord::from(vec!["id", "name"]);
        let layout = ColumnLayout::resolve(&schema, &headers, Path::new("x.csv")).unwrap();
        let normalizer = Normalizer::new(&schema, &layout);

        let bad = SourceRecord::new(4, StringRecord::from(vec!["four", "x"]));
        assert_eq!(
            normalizer.normalize(&bad),
            Err(RejectReason::Malformed {
                column: Some("id".to_string())
            })
        );
    }

    proptest! {
        #[test]
        fn prop_integers_round_trip_exactly(n in any::<i64>()) {
            prop_assert_eq!(parse_integer(&n.to_string()), Some(n));
        }

        #[test]
        fn prop_whitespace_only_text_is_null(s in "[ \t]{0,8}") {
            prop_assert_eq!(normalize_text(&s), None);
        }

        #[test]
        fn prop_text_without_missing_tokens_survives(s in "[a-zA-Z][a-zA-Z0-9 ,.'-]{0,40}") {
            prop_assume!(!MISSING_TOKENS.contains(&s.trim()));
            prop_assert_eq!(normalize_text(&s), Some(s.clone()));
        }
    }
}

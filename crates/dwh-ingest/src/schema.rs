//! Target schemas: columns, natural keys, quality rules and merge policy
//!
//! A [`TargetSchema`] describes one load target end to end. The built-in
//! targets for the goodbooks dataset live at the bottom of this module.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, IngestResult};

/// Staging column carrying the source data-row number.
pub const STAGING_ROW_COLUMN: &str = "stg_row";

/// Default batch size for dimension-sized files
pub const DEFAULT_BOOKS_BATCH_SIZE: usize = 50_000;

/// Default batch size for the multi-million row ratings file
pub const DEFAULT_RATINGS_BATCH_SIZE: usize = 250_000;

/// Semantic type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Exact integer parsed from decimal text
    Integer,
    /// Floating point, only where fractions carry meaning
    Float,
    /// Verbatim text with missing tokens normalised to null
    Text,
}

/// Whether a column must appear in the source header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Required,
    /// Synthesised as null when the file does not carry it
    Optional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: FieldKind,
    /// Unparsable or missing values become null instead of failing the row
    pub nullable: bool,
    pub presence: Presence,
}

impl ColumnSpec {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            nullable: true,
            presence: Presence::Required,
        }
    }

    pub fn integer(name: &str) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    pub fn float(name: &str) -> Self {
        Self::new(name, FieldKind::Float)
    }

    pub fn text(name: &str) -> Self {
        Self::new(name, FieldKind::Text)
    }

    pub fn optional(mut self) -> Self {
        self.presence = Presence::Optional;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Closed interval a numeric column must fall into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeRule {
    pub column: String,
    pub min: f64,
    pub max: f64,
}

/// Reduction applied to staged rows sharing a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Max,
    Min,
    /// Row with the highest source row number wins
    Latest,
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "max" => Ok(Aggregation::Max),
            "min" => Ok(Aggregation::Min),
            "latest" | "last" => Ok(Aggregation::Latest),
            other => Err(format!("unknown aggregation '{}', expected max, min or latest", other)),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Max => write!(f, "max"),
            Aggregation::Min => write!(f, "min"),
            Aggregation::Latest => write!(f, "latest"),
        }
    }
}

/// What happens when a staged key already exists in the permanent table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Existing rows are authoritative; first staged row per key is inserted
    InsertIfAbsent,
    /// Listed columns always reflect the latest staged row
    Overwrite { columns: Vec<String> },
    /// Staged rows are reduced per key, then upserted on the listed columns
    AggregateThenUpsert {
        aggregation: Aggregation,
        columns: Vec<String>,
    },
}

impl ConflictPolicy {
    /// Columns written on conflict, empty for insert-only
    pub fn update_columns(&self) -> &[String] {
        match self {
            ConflictPolicy::InsertIfAbsent => &[],
            ConflictPolicy::Overwrite { columns }
            | ConflictPolicy::AggregateThenUpsert { columns, .. } => columns,
        }
    }

    pub fn label(&self) -> String {
        match self {
            ConflictPolicy::InsertIfAbsent => "insert_if_absent".to_string(),
            ConflictPolicy::Overwrite { .. } => "overwrite".to_string(),
            ConflictPolicy::AggregateThenUpsert { aggregation, .. } => {
                format!("aggregate_{}", aggregation)
            },
        }
    }
}

/// Optionally schema-qualified relation name, validated as a plain identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    schema: Option<String>,
    name: String,
}

impl TableName {
    /// Parse `table` or `schema.table`
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut parts = raw.trim().split('.');
        let first = parts.next().unwrap_or_default();
        let second = parts.next();
        if parts.next().is_some() {
            return Err(format!("'{}' has too many name parts", raw));
        }

        let (schema, name) = match second {
            Some(name) => (Some(first), name),
            None => (None, first),
        };

        for part in schema.iter().chain(std::iter::once(&name)) {
            if !is_identifier(part) {
                return Err(format!("'{}' is not a valid identifier in '{}'", part, raw));
            }
        }

        Ok(Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        })
    }

    /// Quoted form for SQL text
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Double-quote an identifier that already passed [`is_identifier`]
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident)
}

/// Complete description of one load target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSchema {
    pub name: String,
    pub staging: TableName,
    pub target: TableName,
    pub columns: Vec<ColumnSpec>,
    /// Natural key, single or composite
    pub key: Vec<String>,
    /// Columns that must be non-null after normalisation
    pub required: Vec<String>,
    pub ranges: Vec<RangeRule>,
    pub policy: ConflictPolicy,
    pub default_batch_size: usize,
}

impl TargetSchema {
    pub fn new(
        name: &str,
        staging: &str,
        target: &str,
        columns: Vec<ColumnSpec>,
        key: &[&str],
        policy: ConflictPolicy,
    ) -> IngestResult<Self> {
        let staging = TableName::parse(staging).map_err(|e| IngestError::schema(name, e))?;
        let target = TableName::parse(target).map_err(|e| IngestError::schema(name, e))?;

        Ok(Self {
            name: name.to_string(),
            staging,
            target,
            columns,
            key: key.iter().map(|k| k.to_string()).collect(),
            required: Vec::new(),
            ranges: Vec::new(),
            policy,
            default_batch_size: DEFAULT_BOOKS_BATCH_SIZE,
        })
    }

    pub fn require(mut self, columns: &[&str]) -> Self {
        self.required.extend(columns.iter().map(|c| c.to_string()));
        self
    }

    pub fn range(mut self, column: &str, min: f64, max: f64) -> Self {
        self.ranges.push(RangeRule {
            column: column.to_string(),
            min,
            max,
        });
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.default_batch_size = batch_size;
        self
    }

    /// Replace the aggregation of an aggregate-then-upsert target
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        if let ConflictPolicy::AggregateThenUpsert {
            aggregation: ref mut current,
            ..
        } = self.policy
        {
            *current = aggregation;
        }
        self
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Check that every name referenced by keys, rules and policy exists and
    /// that the policy can produce exactly one row per key.
    pub fn validate(self) -> IngestResult<Self> {
        let err = |reason: String| IngestError::schema(&self.name, reason);

        if self.columns.is_empty() {
            return Err(err("no columns declared".to_string()));
        }
        if self.key.is_empty() {
            return Err(err("no natural key declared".to_string()));
        }
        if self.default_batch_size == 0 {
            return Err(err("batch size must be greater than 0".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for column in &self.columns {
            if !is_identifier(&column.name) || column.name == STAGING_ROW_COLUMN {
                return Err(err(format!("'{}' is not a usable column name", column.name)));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(err(format!("column '{}' declared twice", column.name)));
            }
        }

        let referenced = self
            .key
            .iter()
            .chain(&self.required)
            .chain(self.ranges.iter().map(|r| &r.column))
            .chain(self.policy.update_columns());
        for name in referenced {
            if self.column_index(name).is_none() {
                return Err(err(format!("unknown column '{}'", name)));
            }
        }

        for rule in &self.ranges {
            let kind = self.columns.iter().find(|c| c.name == rule.column).map(|c| c.kind);
            if kind == Some(FieldKind::Text) || rule.min > rule.max {
                return Err(err(format!("invalid range rule on '{}'", rule.column)));
            }
        }

        if let Some(k) = self.policy.update_columns().iter().find(|c| self.key.contains(*c)) {
            return Err(err(format!("key column '{}' cannot be updated on conflict", k)));
        }

        if let ConflictPolicy::AggregateThenUpsert {
            aggregation: Aggregation::Max | Aggregation::Min,
            columns,
        } = &self.policy
        {
            // Grouping needs a reduction for every non-key column
            let loose = self
                .columns
                .iter()
                .find(|c| !self.key.contains(&c.name) && !columns.contains(&c.name));
            if let Some(loose) = loose {
                return Err(err(format!(
                    "column '{}' is neither key nor aggregated",
                    loose.name
                )));
            }
        }

        Ok(self)
    }
}

// ============================================================================
// Built-in targets
// ============================================================================

/// Load targets shipped with the tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BuiltinTarget {
    /// books.csv -> dwh.books (insert if absent)
    Books,
    /// books.csv -> dwh.book_identifiers (overwrite external id)
    BookIdentifiers,
    /// ratings.csv -> dwh.fact_rating (aggregate per user/book)
    Ratings,
}

impl BuiltinTarget {
    pub fn all() -> [BuiltinTarget; 3] {
        [
            BuiltinTarget::Books,
            BuiltinTarget::BookIdentifiers,
            BuiltinTarget::Ratings,
        ]
    }

    pub fn schema(self, aggregation: Aggregation) -> IngestResult<TargetSchema> {
        match self {
            BuiltinTarget::Books => books(),
            BuiltinTarget::BookIdentifiers => book_identifiers(),
            BuiltinTarget::Ratings => ratings(aggregation),
        }
    }
}

/// `dwh.books`: the table is authoritative, staging only adds new books
pub fn books() -> IngestResult<TargetSchema> {
    let columns = vec![
        ColumnSpec::integer("book_id"),
        ColumnSpec::integer("goodreads_book_id").optional(),
        ColumnSpec::integer("best_book_id"),
        ColumnSpec::integer("work_id"),
        ColumnSpec::integer("books_count"),
        // ISBNs are identifiers, not numbers: leading zeros and exactness matter
        ColumnSpec::text("isbn"),
        ColumnSpec::text("isbn13"),
        ColumnSpec::text("authors"),
        ColumnSpec::integer("original_publication_year"),
        ColumnSpec::text("original_title"),
        ColumnSpec::text("title"),
        ColumnSpec::text("language_code"),
        ColumnSpec::float("average_rating"),
        ColumnSpec::integer("ratings_count"),
        ColumnSpec::integer("work_ratings_count"),
        ColumnSpec::integer("work_text_reviews_count"),
    ];

    TargetSchema::new(
        "books",
        "dwh.books_stg",
        "dwh.books",
        columns,
        &["book_id"],
        ConflictPolicy::InsertIfAbsent,
    )?
    .require(&["book_id"])
    .batch_size(DEFAULT_BOOKS_BATCH_SIZE)
    .validate()
}

/// `dwh.book_identifiers`: the remapped goodreads id follows the latest load.
///
/// `goodreads_book_id` is the overwritten column, so a file without it is
/// refused rather than loaded as nulls.
pub fn book_identifiers() -> IngestResult<TargetSchema> {
    let columns = vec![
        ColumnSpec::integer("book_id"),
        ColumnSpec::integer("goodreads_book_id"),
        ColumnSpec::integer("best_book_id"),
        ColumnSpec::integer("work_id"),
    ];

    TargetSchema::new(
        "book-identifiers",
        "dwh.book_identifiers_stg",
        "dwh.book_identifiers",
        columns,
        &["book_id"],
        ConflictPolicy::Overwrite {
            columns: vec!["goodreads_book_id".to_string()],
        },
    )?
    .require(&["book_id"])
    .batch_size(DEFAULT_BOOKS_BATCH_SIZE)
    .validate()
}

/// `dwh.fact_rating`: one rating per (user, book), duplicates reduced first
pub fn ratings(aggregation: Aggregation) -> IngestResult<TargetSchema> {
    let columns = vec![
        ColumnSpec::integer("user_id"),
        ColumnSpec::integer("book_id"),
        ColumnSpec::integer("rating"),
    ];

    TargetSchema::new(
        "ratings",
        "dwh.ratings_stg",
        "dwh.fact_rating",
        columns,
        &["user_id", "book_id"],
        ConflictPolicy::AggregateThenUpsert {
            aggregation,
            columns: vec!["rating".to_string()],
        },
    )?
    .require(&["user_id", "book_id", "rating"])
    .range("rating", 1.0, 5.0)
    .batch_size(DEFAULT_RATINGS_BATCH_SIZE)
    .validate()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_parse() {
        let name = TableName::parse("dwh.books_stg").unwrap();
        assert_eq!(name.to_string(), "dwh.books_stg");
        assert_eq!(name.quoted(), "\"dwh\".\"books_stg\"");

        assert_eq!(TableName::parse("books").unwrap().quoted(), "\"books\"");
        assert!(TableName::parse("dwh.books; DROP TABLE x").is_err());
        assert!(TableName::parse("a.b.c").is_err());
        assert!(TableName::parse("1books").is_err());
    }

    #[test]
    fn test_builtin_targets_validate() {
        for target in BuiltinTarget::all() {
            let schema = target.schema(Aggregation::Max).unwrap();
            assert!(!schema.columns.is_empty());
        }
    }

    #[test]
    fn test_books_goodreads_id_is_optional() {
        let schema = books().unwrap();
        let col = &schema.columns[schema.column_index("goodreads_book_id").unwrap()];
        assert_eq!(col.presence, Presence::Optional);
        assert_eq!(schema.columns[schema.column_index("isbn13").unwrap()].kind, FieldKind::Text);
    }

    #[test]
    fn test_identifiers_require_the_overwritten_column() {
        let schema = book_identifiers().unwrap();
        let col = &schema.columns[schema.column_index("goodreads_book_id").unwrap()];
        assert_eq!(col.presence, Presence::Required);
    }

    #[test]
    fn test_ratings_aggregation_is_configurable() {
        let schema = ratings(Aggregation::Max).unwrap().with_aggregation(Aggregation::Latest);
        assert_eq!(schema.policy.label(), "aggregate_latest");
    }

    #[test]
    fn test_validate_rejects_unknown_columns() {
        let result = TargetSchema::new(
            "broken",
            "stg",
            "tgt",
            vec![ColumnSpec::integer("id")],
            &["id"],
            ConflictPolicy::Overwrite {
                columns: vec!["missing".to_string()],
            },
        )
        .unwrap()
        .validate();

        assert!(matches!(result, Err(IngestError::Schema { .. })));
    }

    #[test]
    fn test_validate_rejects_ungrouped_columns() {
        let result = TargetSchema::new(
            "broken",
            "stg",
            "tgt",
            vec![
                ColumnSpec::integer("id"),
                ColumnSpec::integer("score"),
                ColumnSpec::text("note"),
            ],
            &["id"],
            ConflictPolicy::AggregateThenUpsert {
                aggregation: Aggregation::Max,
                columns: vec!["score".to_string()],
            },
        )
        .unwrap()
        .validate();

        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_updating_key() {
        let result = TargetSchema::new(
            "broken",
            "stg",
            "tgt",
            vec![ColumnSpec::integer("id"), ColumnSpec::integer("v")],
            &["id"],
            ConflictPolicy::Overwrite {
                columns: vec!["id".to_string()],
            },
        )
        .unwrap()
        .validate();

        assert!(result.is_err());
    }

    #[test]
    fn test_aggregation_from_str() {
        assert_eq!("MAX".parse::<Aggregation>().unwrap(), Aggregation::Max);
        assert_eq!("latest".parse::<Aggregation>().unwrap(), Aggregation::Latest);
        assert!("avg".parse::<Aggregation>().is_err());
    }
}

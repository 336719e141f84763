use serde::{Deserialize, Serialize};

/// Value type of a report column, as declared in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    String,
    DateTime,
    BigDecimal,
    Interval,
    Unknown,
}

impl ColumnType {
    /// Classify a raw manifest type tag. The first `Optional` marker is
    /// stripped before matching; anything unrecognized is `Unknown`.
    pub fn classify(raw: &str) -> Self {
        match raw.replacen("Optional", "", 1).as_str() {
            "String" => ColumnType::String,
            "DateTime" => ColumnType::DateTime,
            "BigDecimal" => ColumnType::BigDecimal,
            "Interval" => ColumnType::Interval,
            _ => ColumnType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawColumn {
    category: String,
    name: String,
    #[serde(rename = "type")]
    kind: String,
}

/// One CSV field's metadata. Normalized forms are computed when the column
/// is built and never change afterwards, so columns can be shared freely
/// across concurrent row transformations.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "RawColumn", into = "RawColumn")]
pub struct Column {
    category: String,
    name: String,
    kind: String,
    normalized_category: String,
    normalized_name: String,
    normalized_type: ColumnType,
}

impl Column {
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        let category = category.into();
        let name = name.into();
        let kind = kind.into();
        Self {
            normalized_category: snake_case(&category),
            normalized_name: snake_case(&name).replace(':', "_"),
            normalized_type: ColumnType::classify(&kind),
            category,
            name,
            kind,
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw type tag, e.g. `OptionalBigDecimal`.
    pub fn raw_type(&self) -> &str {
        &self.kind
    }

    pub fn normalized_category(&self) -> &str {
        &self.normalized_category
    }

    /// snake_cased name with colons replaced by underscores.
    pub fn normalized_name(&self) -> &str {
        &self.normalized_name
    }

    pub fn normalized_type(&self) -> ColumnType {
        self.normalized_type
    }
}

impl From<RawColumn> for Column {
    fn from(raw: RawColumn) -> Self {
        Column::new(raw.category, raw.name, raw.kind)
    }
}

impl From<Column> for RawColumn {
    fn from(column: Column) -> Self {
        RawColumn {
            category: column.category,
            name: column.name,
            kind: column.kind,
        }
    }
}

/// Fold camelCase into snake_case: a `_` goes in at every lowercase to
/// uppercase boundary, then the whole string is lowercased.
pub fn snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    let mut prev_lower = false;
    for c in s.chars() {
        if prev_lower && c.is_ascii_uppercase() {
            out.push('_');
        }
        prev_lower = c.is_ascii_lowercase();
        out.push(c);
    }
    out.to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct BillingPeriod {
    pub start: String,
    pub end: String,
}

/// Metadata describing one report snapshot for a billing period.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Snapshot identifier. Two manifests for the same period with the same
    /// id describe the same data.
    pub report_id: String,
    #[serde(default)]
    pub report_name: String,
    pub billing_period: BillingPeriod,
    /// Order matches the field order of every report CSV.
    pub columns: Vec<Column>,
    pub report_keys: Vec<String>,
    /// e.g. `GZIP`; empty when the manifest does not say.
    #[serde(default)]
    pub compression: String,
    #[serde(default)]
    pub charset: String,
    #[serde(default)]
    pub content_type: String,
}

impl Manifest {
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Name of the index holding this manifest's report. Depends only on the
    /// billing period dates.
    pub fn index_name(&self, prefix: &str) -> String {
        format!(
            "{}-{}-{}",
            prefix,
            date_part(&self.billing_period.start),
            date_part(&self.billing_period.end)
        )
    }
}

fn date_part(timestamp: &str) -> &str {
    timestamp.split('T').next().unwrap_or(timestamp)
}

//! Index schema derived from a manifest's column set.

use serde_json::{json, Map, Value};

use crate::manifest::{Column, ColumnType};

/// Scaling factor for `BigDecimal` columns: eight decimal places survive
/// without float drift.
pub const SCALING_FACTOR: f64 = 100_000_000.0;

/// Field mapping for one column, or `None` when the index should fall back
/// to dynamic mapping.
pub fn column_mapping(column: &Column) -> Option<Value> {
    match column.normalized_type() {
        ColumnType::String => Some(json!({ "type": "keyword" })),
        ColumnType::DateTime => Some(json!({ "type": "date" })),
        ColumnType::BigDecimal => Some(json!({
            "type": "scaled_float",
            "scaling_factor": SCALING_FACTOR,
        })),
        ColumnType::Interval => Some(json!({
            "type": "date_range",
            "format": "strict_date_optional_time",
        })),
        ColumnType::Unknown => None,
    }
}

/// Mappings grouped by normalized category, one nested object per category.
pub fn mappings(columns: &[Column]) -> Value {
    let mut categories: Map<String, Value> = Map::new();
    for column in columns {
        let category = categories
            .entry(column.normalized_category().to_string())
            .or_insert_with(|| json!({ "properties": {} }));
        let Some(mapping) = column_mapping(column) else {
            continue;
        };
        if let Some(props) = category
            .get_mut("properties")
            .and_then(Value::as_object_mut)
        {
            props.insert(column.normalized_name().to_string(), mapping);
        }
    }
    json!({ "properties": categories })
}

/// Full create-index body: settings plus mappings.
pub fn index_body(columns: &[Column], shards: u32) -> Value {
    json!({
        "settings": { "index": { "number_of_shards": shards } },
        "mappings": mappings(columns),
    })
}

/// Body of the per-period bookkeeping index.
pub fn metadata_index_body() -> Value {
    json!({
        "settings": { "index": { "number_of_shards": 1 } },
        "mappings": {
            "properties": {
                "report_id": { "type": "keyword", "store": true },
                "last_update": { "type": "date" },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<Column> {
        vec![
            Column::new("lineItem", "UsageAmount", "BigDecimal"),
            Column::new("lineItem", "UsageStartDate", "DateTime"),
            Column::new("lineItem", "LineItemType", "OptionalString"),
            Column::new("identity", "TimeInterval", "Interval"),
            Column::new("resourceTags", "user:Team", "Mystery"),
        ]
    }

    #[test]
    fn groups_fields_by_category() {
        let m = mappings(&columns());
        let line_item = &m["properties"]["line_item"]["properties"];
        assert_eq!(line_item["usage_amount"]["type"], "scaled_float");
        assert_eq!(line_item["usage_amount"]["scaling_factor"], 100_000_000.0);
        assert_eq!(line_item["usage_start_date"]["type"], "date");
        assert_eq!(line_item["line_item_type"]["type"], "keyword");

        let identity = &m["properties"]["identity"]["properties"];
        assert_eq!(identity["time_interval"]["type"], "date_range");
        assert_eq!(identity["time_interval"]["format"], "strict_date_optional_time");
    }

    #[test]
    fn unknown_types_get_no_explicit_mapping() {
        let m = mappings(&columns());
        let tags = m["properties"]["resource_tags"]["properties"]
            .as_object()
            .expect("category object");
        assert!(tags.is_empty());
    }

    #[test]
    fn body_carries_shard_setting() {
        let body = index_body(&columns(), 3);
        assert_eq!(body["settings"]["index"]["number_of_shards"], 3);
        assert!(body["mappings"]["properties"].is_object());
        assert_eq!(index_body(&columns(), 3), body);
    }
}

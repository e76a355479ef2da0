use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{Field, Row};

/// Row as returned by the REST API: `{"f": [{"v": ...}, ...]}`
#[derive(Debug, Deserialize)]
pub(crate) struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Value,
}

pub(crate) fn convert_row(fields: &[Field], row: &TableRow) -> Row {
    fields
        .iter()
        .zip(row.f.iter())
        .map(|(field, cell)| (field.name.clone(), convert_value(field, &cell.v)))
        .collect()
}

fn convert_value(field: &Field, raw: &Value) -> Value {
    if raw.is_null() {
        return Value::Null;
    }

    if field.is_repeated() {
        // repeated values arrive as [{"v": x}, ...]
        return match raw.as_array() {
            Some(items) => items
                .iter()
                .map(|item| convert_single(field, item.get("v").unwrap_or(&Value::Null)))
                .collect(),
            None => Value::Null,
        };
    }

    convert_single(field, raw)
}

fn convert_single(field: &Field, raw: &Value) -> Value {
    if raw.is_null() {
        return Value::Null;
    }

    match field.field_type.to_ascii_uppercase().as_str() {
        "RECORD" | "STRUCT" => {
            let Some(cells) = raw.get("f").and_then(Value::as_array) else {
                return Value::Null;
            };
            let record: Row = field
                .fields
                .iter()
                .zip(cells.iter())
                .map(|(sub, cell)| {
                    let value = cell.get("v").unwrap_or(&Value::Null);
                    (sub.name.clone(), convert_value(sub, value))
                })
                .collect();
            Value::Object(record)
        }

        "INTEGER" | "INT64" => text(raw)
            .and_then(|s| s.parse::<i64>().ok())
            .map(|v| json!(v))
            .unwrap_or_else(|| raw.clone()),

        // NaN and infinities have no JSON number form and stay as text
        "FLOAT" | "FLOAT64" => text(raw)
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .map(|v| json!(v))
            .unwrap_or_else(|| raw.clone()),

        "BOOLEAN" | "BOOL" => match text(raw) {
            Some(s) if s.eq_ignore_ascii_case("true") => json!(true),
            Some(s) if s.eq_ignore_ascii_case("false") => json!(false),
            _ => raw.clone(),
        },

        "TIMESTAMP" => text(raw)
            .and_then(parse_timestamp)
            .map(|ts| json!(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
            .unwrap_or_else(|| raw.clone()),

        "JSON" => text(raw)
            .and_then(|s| serde_json::from_str::<Value>(s).ok())
            .unwrap_or_else(|| raw.clone()),

        // NUMERIC and BIGNUMERIC stay textual to keep their precision.
        // DATE, DATETIME, TIME, BYTES (base64) and GEOGRAPHY are already in display form.
        _ => raw.clone(),
    }
}

fn text(raw: &Value) -> Option<&str> {
    raw.as_str()
}

/// Timestamps come back as integer microseconds when `useInt64Timestamp` is set,
/// and as floating point seconds otherwise.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(micros) = raw.parse::<i64>() {
        return DateTime::from_timestamp_micros(micros);
    }
    let seconds = raw.parse::<f64>().ok()?;
    if !seconds.is_finite() {
        return None;
    }
    let micros = (seconds * 1_000_000.0).round() as i64;
    DateTime::from_timestamp_micros(micros)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(value: Value) -> TableRow {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn scalars_follow_the_declared_type() {
        let fields = vec![
            Field::new("id", "INTEGER"),
            Field::new("price", "FLOAT"),
            Field::new("active", "BOOLEAN"),
            Field::new("name", "STRING"),
            Field::new("amount", "NUMERIC"),
            Field::new("day", "DATE"),
        ];
        let raw = row(json!({"f": [
            {"v": "42"},
            {"v": "9.5"},
            {"v": "true"},
            {"v": "widget"},
            {"v": "12345678901234567890.123"},
            {"v": "2024-01-31"},
        ]}));

        let converted = convert_row(&fields, &raw);
        assert_eq!(
            Value::Object(converted),
            json!({
                "id": 42,
                "price": 9.5,
                "active": true,
                "name": "widget",
                "amount": "12345678901234567890.123",
                "day": "2024-01-31",
            })
        );
    }

    #[test]
    fn columns_keep_result_order() {
        let fields = vec![
            Field::new("zeta", "STRING"),
            Field::new("alpha", "STRING"),
            Field::new("mid", "STRING"),
        ];
        let raw = row(json!({"f": [{"v": "z"}, {"v": "a"}, {"v": "m"}]}));
        let keys: Vec<_> = convert_row(&fields, &raw).keys().cloned().collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn nulls_stay_null() {
        let fields = vec![Field::new("id", "INTEGER"), Field::new("name", "STRING")];
        let raw = row(json!({"f": [{"v": null}, {}]}));
        assert_eq!(
            Value::Object(convert_row(&fields, &raw)),
            json!({"id": null, "name": null})
        );
    }

    #[test]
    fn timestamps_become_rfc3339() {
        let fields = vec![Field::new("micros", "TIMESTAMP"), Field::new("secs", "TIMESTAMP")];
        let raw = row(json!({"f": [{"v": "1700000000123456"}, {"v": "1.7E9"}]}));
        assert_eq!(
            Value::Object(convert_row(&fields, &raw)),
            json!({
                "micros": "2023-11-14T22:13:20.123456Z",
                "secs": "2023-11-14T22:13:20Z",
            })
        );
    }

    #[test]
    fn records_and_repeated_fields_nest() {
        let mut address = Field::new("address", "RECORD");
        address.fields = vec![Field::new("city", "STRING"), Field::new("zip", "INTEGER")];
        let mut tags = Field::new("tags", "STRING");
        tags.mode = "REPEATED".to_string();
        let mut scores = Field::new("scores", "INTEGER");
        scores.mode = "REPEATED".to_string();

        let fields = vec![address, tags, scores];
        let raw = row(json!({"f": [
            {"v": {"f": [{"v": "Oslo"}, {"v": "150"}]}},
            {"v": [{"v": "a"}, {"v": "b"}]},
            {"v": [{"v": "1"}, {"v": "2"}]},
        ]}));

        assert_eq!(
            Value::Object(convert_row(&fields, &raw)),
            json!({
                "address": {"city": "Oslo", "zip": 150},
                "tags": ["a", "b"],
                "scores": [1, 2],
            })
        );
    }

    #[test]
    fn json_columns_are_parsed() {
        let fields = vec![Field::new("payload", "JSON"), Field::new("broken", "JSON")];
        let raw = row(json!({"f": [{"v": "{\"a\":[1,2]}"}, {"v": "{not json"}]}));
        assert_eq!(
            Value::Object(convert_row(&fields, &raw)),
            json!({"payload": {"a": [1, 2]}, "broken": "{not json"})
        );
    }

    #[test]
    fn non_finite_floats_stay_textual() {
        let fields = vec![Field::new("x", "FLOAT64")];
        let raw = row(json!({"f": [{"v": "NaN"}]}));
        assert_eq!(Value::Object(convert_row(&fields, &raw)), json!({"x": "NaN"}));
    }
}

//! Row decoding.
//!
//! Rows from every backend are turned into a `serde_json` map keyed by column
//! name. This is the common currency between the executor and the session's
//! entity mapping.
//!
//! Each column is first classified by its declared type name into a
//! `TypeCategory`; the backend decoder then reads the value for that category.
//! SQLite columns without a declared type fall back to the value's runtime type.

use crate::models::{DatabaseType, JsonRow};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if db == DatabaseType::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("text") || lower == "string" {
        return TypeCategory::Text;
    }

    // Dates, times and expression columns without a declared type
    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

// =============================================================================
// Binary Encoding
// =============================================================================

/// Encode binary column data as a base64 JSON string.
pub fn encode_binary(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

// =============================================================================
// Row to JSON Trait
// =============================================================================

/// Trait for converting database rows to JSON maps.
pub trait RowToJson {
    fn to_json_map(&self) -> JsonRow;
}

impl RowToJson for MySqlRow {
    fn to_json_map(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::MySQL);
                let value = mysql::decode_column(self, idx, category);
                (col.name().to_string(), value)
            })
            .collect()
    }
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::PostgreSQL);
                let value = postgres::decode_column(self, idx, category);
                (col.name().to_string(), value)
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| (col.name().to_string(), sqlite::decode_column(self, idx)))
            .collect()
    }
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

/// Decoders that read the same way on every backend.
macro_rules! common_decoders {
    ($row:ty) => {
        fn decode_boolean(row: &$row, idx: usize) -> JsonValue {
            match row.try_get::<Option<bool>, _>(idx) {
                Ok(Some(v)) => JsonValue::Bool(v),
                _ => JsonValue::Null,
            }
        }

        fn decode_binary(row: &$row, idx: usize) -> JsonValue {
            match row.try_get::<Option<Vec<u8>>, _>(idx) {
                Ok(Some(bytes)) => encode_binary(&bytes),
                _ => JsonValue::Null,
            }
        }

        fn decode_text(row: &$row, idx: usize) -> JsonValue {
            match row.try_get::<Option<String>, _>(idx) {
                Ok(Some(s)) => JsonValue::String(s),
                _ => JsonValue::Null,
            }
        }
    };
}

/// Decoders for backends with native JSON, DECIMAL and float4/float8 columns.
macro_rules! typed_decoders {
    ($row:ty, $decimal_name:literal) => {
        common_decoders!($row);

        fn decode_decimal(row: &$row, idx: usize) -> JsonValue {
            match row.try_get::<Option<RawDecimal>, _>(idx) {
                Ok(Some(v)) => JsonValue::String(v.0),
                Ok(None) => JsonValue::Null,
                Err(e) => {
                    tracing::warn!(column = idx, error = %e, concat!("Failed to decode ", $decimal_name));
                    JsonValue::Null
                }
            }
        }

        fn decode_float(row: &$row, idx: usize) -> JsonValue {
            match row.try_get::<Option<f64>, _>(idx) {
                Ok(Some(v)) => float_value(v),
                Ok(None) => JsonValue::Null,
                Err(_) => match row.try_get::<Option<f32>, _>(idx) {
                    Ok(Some(v)) => float_value(f64::from(v)),
                    _ => JsonValue::Null,
                },
            }
        }

        fn decode_json(row: &$row, idx: usize) -> JsonValue {
            row.try_get::<Option<JsonValue>, _>(idx)
                .ok()
                .flatten()
                .unwrap_or(JsonValue::Null)
        }

        pub fn decode_column(row: &$row, idx: usize, category: TypeCategory) -> JsonValue {
            match category {
                TypeCategory::Decimal => decode_decimal(row, idx),
                TypeCategory::Integer => decode_integer(row, idx),
                TypeCategory::Boolean => decode_boolean(row, idx),
                TypeCategory::Float => decode_float(row, idx),
                TypeCategory::Binary => decode_binary(row, idx),
                TypeCategory::Json => decode_json(row, idx),
                _ => decode_text(row, idx),
            }
        }
    };
}

/// First integer width the driver accepts for the column.
macro_rules! first_integer {
    ($row:expr, $idx:expr, $($ty:ty),+) => {{
        let mut value = JsonValue::Null;
        $(
            if value.is_null() {
                if let Ok(Some(v)) = $row.try_get::<Option<$ty>, _>($idx) {
                    value = JsonValue::Number(v.into());
                }
            }
        )+
        value
    }};
}

mod mysql {
    use super::*;

    typed_decoders!(MySqlRow, "DECIMAL");

    // MySQL reports signed and unsigned widths separately
    fn decode_integer(row: &MySqlRow, idx: usize) -> JsonValue {
        first_integer!(row, idx, i64, u64, i32, u32, i16, u16, i8, u8)
    }
}

mod postgres {
    use super::*;

    typed_decoders!(PgRow, "NUMERIC");

    fn decode_integer(row: &PgRow, idx: usize) -> JsonValue {
        first_integer!(row, idx, i64, i32, i16)
    }
}

mod sqlite {
    use super::*;

    common_decoders!(SqliteRow);

    /// SQLite is dynamically typed, so the category comes from the stored value
    /// when the declared type is missing or unhelpful (e.g. `COUNT(*)`).
    pub fn decode_column(row: &SqliteRow, idx: usize) -> JsonValue {
        let declared = row.columns()[idx].type_info().name().to_string();
        let runtime = match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => return JsonValue::Null,
            Ok(raw) => raw.type_info().name().to_string(),
            Err(_) => return JsonValue::Null,
        };

        let mut category = categorize_type(&declared, DatabaseType::SQLite);
        if matches!(category, TypeCategory::Unknown | TypeCategory::Json)
            || declared.eq_ignore_ascii_case("null")
        {
            category = categorize_type(&runtime, DatabaseType::SQLite);
        }

        match category {
            TypeCategory::Integer => match row.try_get::<Option<i64>, _>(idx) {
                Ok(Some(v)) => JsonValue::Number(v.into()),
                // Integer affinity holding a non-integer value
                _ => decode_float(row, idx),
            },
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float | TypeCategory::Decimal => decode_float(row, idx),
            TypeCategory::Binary => decode_binary(row, idx),
            _ => decode_text(row, idx),
        }
    }

    fn decode_float(row: &SqliteRow, idx: usize) -> JsonValue {
        match row.try_get::<Option<f64>, _>(idx) {
            Ok(Some(v)) => float_value(v),
            _ => decode_text(row, idx),
        }
    }
}

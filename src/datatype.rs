// used for persistence
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

// used for timestamps in the database
use chrono::{DateTime, SecondsFormat, Utc};
// used for decimal numbers
use bigdecimal::BigDecimal;
// used for JSON
use serde_json::Value as JsonValue;

// used when parsing a string to a value
use std::str::FromStr;
// used to print out readable forms of a data type
use std::fmt;
// used to indicate that data types need to be hashable
use std::hash::{Hash, Hasher};

use crate::construct::{Ciid, LayerId};
use crate::error::{LayerkeeperError, Result};

// ------------- Scalar Types --------------
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ScalarType {
    Text,
    MultilineText,
    Integer,
    Decimal,
    Json,
    Time,
}
impl ScalarType {
    pub fn identifier(&self) -> u8 {
        match self {
            Self::Text => 1,
            Self::MultilineText => 2,
            Self::Integer => 3,
            Self::Decimal => 4,
            Self::Json => 5,
            Self::Time => 6,
        }
    }
    pub fn data_type(&self) -> &'static str {
        match self {
            Self::Text => "Text",
            Self::MultilineText => "MultilineText",
            Self::Integer => "Integer",
            Self::Decimal => "Decimal",
            Self::Json => "JSON",
            Self::Time => "Time",
        }
    }
    pub fn from_data_type(data_type: &str) -> Result<Self> {
        match data_type {
            "Text" => Ok(Self::Text),
            "MultilineText" => Ok(Self::MultilineText),
            "Integer" => Ok(Self::Integer),
            "Decimal" => Ok(Self::Decimal),
            "JSON" => Ok(Self::Json),
            "Time" => Ok(Self::Time),
            other => Err(corrupt(format!("unknown data type '{}'", other))),
        }
    }
}

fn corrupt(message: String) -> LayerkeeperError {
    LayerkeeperError::DataCorruption { message }
}

// Special types below
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct Decimal(pub BigDecimal);

impl Hash for Decimal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.normalized().to_string().hash(state);
    }
}
impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct Json(pub JsonValue);

impl Hash for Json {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_string().hash(state);
    }
}
impl fmt::Display for Json {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ------------- Scalars --------------
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Scalar {
    Text(String),
    MultilineText(String),
    Integer(i64),
    Decimal(Decimal),
    Json(Json),
    Time(DateTime<Utc>),
}
impl Scalar {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Self::Text(_) => ScalarType::Text,
            Self::MultilineText(_) => ScalarType::MultilineText,
            Self::Integer(_) => ScalarType::Integer,
            Self::Decimal(_) => ScalarType::Decimal,
            Self::Json(_) => ScalarType::Json,
            Self::Time(_) => ScalarType::Time,
        }
    }
    pub fn marshal(&self) -> String {
        match self {
            Self::Text(s) | Self::MultilineText(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Decimal(d) => d.0.to_string(),
            Self::Json(j) => j.0.to_string(),
            Self::Time(t) => t.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        }
    }
    pub fn unmarshal(scalar_type: ScalarType, text: &str) -> Result<Self> {
        match scalar_type {
            ScalarType::Text => Ok(Self::Text(text.to_owned())),
            ScalarType::MultilineText => Ok(Self::MultilineText(text.to_owned())),
            ScalarType::Integer => text
                .parse::<i64>()
                .map(Self::Integer)
                .map_err(|e| corrupt(format!("'{}' is not an integer: {}", text, e))),
            ScalarType::Decimal => BigDecimal::from_str(text)
                .map(|d| Self::Decimal(Decimal(d)))
                .map_err(|e| corrupt(format!("'{}' is not a decimal: {}", text, e))),
            ScalarType::Json => serde_json::from_str::<JsonValue>(text)
                .map(|j| Self::Json(Json(j)))
                .map_err(|e| corrupt(format!("'{}' is not JSON: {}", text, e))),
            ScalarType::Time => DateTime::parse_from_rfc3339(text)
                .map(|t| Self::Time(t.with_timezone(&Utc)))
                .map_err(|e| corrupt(format!("'{}' is not a time: {}", text, e))),
        }
    }
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Text(s) | Self::MultilineText(s) => JsonValue::String(s.clone()),
            Self::Integer(i) => JsonValue::from(*i),
            Self::Decimal(d) => JsonValue::String(d.0.to_string()),
            Self::Json(j) => j.0.clone(),
            Self::Time(_) => JsonValue::String(self.marshal()),
        }
    }
}
impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.marshal())
    }
}

// ------------- Attribute Values --------------
/// A typed value, either a single scalar or a non-empty list of scalars of
/// one type.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum AttributeValue {
    Scalar(Scalar),
    Array(Vec<Scalar>),
}
impl AttributeValue {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Scalar(Scalar::Text(s.into()))
    }
    pub fn multiline_text(s: impl Into<String>) -> Self {
        Self::Scalar(Scalar::MultilineText(s.into()))
    }
    pub fn integer(i: i64) -> Self {
        Self::Scalar(Scalar::Integer(i))
    }
    pub fn decimal(d: BigDecimal) -> Self {
        Self::Scalar(Scalar::Decimal(Decimal(d)))
    }
    pub fn json(j: JsonValue) -> Self {
        Self::Scalar(Scalar::Json(Json(j)))
    }
    pub fn time(t: DateTime<Utc>) -> Self {
        Self::Scalar(Scalar::Time(t))
    }
    pub fn array(items: Vec<Scalar>) -> Result<Self> {
        let Some(first) = items.first() else {
            return Err(LayerkeeperError::Invariant(
                "array values must have at least one element".into(),
            ));
        };
        let scalar_type = first.scalar_type();
        if items.iter().any(|s| s.scalar_type() != scalar_type) {
            return Err(LayerkeeperError::Invariant(format!(
                "array values must be homogeneous, expected only {}",
                scalar_type.data_type()
            )));
        }
        Ok(Self::Array(items))
    }
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Self::Scalar(s) => s.scalar_type(),
            // arrays are never empty, see array()
            Self::Array(items) => items
                .first()
                .map(Scalar::scalar_type)
                .unwrap_or(ScalarType::Text),
        }
    }
    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }
    /// Storage form: data type name, array flag and text payload. Arrays are
    /// stored as a JSON list of the marshalled scalars.
    pub fn marshal(&self) -> Result<(&'static str, bool, String)> {
        let data_type = self.scalar_type().data_type();
        match self {
            Self::Scalar(s) => Ok((data_type, false, s.marshal())),
            Self::Array(items) => {
                let texts: Vec<String> = items.iter().map(Scalar::marshal).collect();
                Ok((data_type, true, serde_json::to_string(&texts)?))
            }
        }
    }
    pub fn unmarshal(data_type: &str, is_array: bool, text: &str) -> Result<Self> {
        let scalar_type = ScalarType::from_data_type(data_type)?;
        if is_array {
            let texts: Vec<String> = serde_json::from_str(text)
                .map_err(|e| corrupt(format!("'{}' is not an array: {}", text, e)))?;
            let items = texts
                .iter()
                .map(|t| Scalar::unmarshal(scalar_type, t))
                .collect::<Result<Vec<_>>>()?;
            if items.is_empty() {
                return Err(corrupt("stored array value is empty".into()));
            }
            Ok(Self::Array(items))
        } else {
            Scalar::unmarshal(scalar_type, text).map(Self::Scalar)
        }
    }
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Scalar(s) => s.to_json(),
            Self::Array(items) => JsonValue::Array(items.iter().map(Scalar::to_json).collect()),
        }
    }
}
impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::text(s)
    }
}
impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        Self::text(s)
    }
}
impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        Self::integer(i)
    }
}
impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Scalar(s) => write!(f, "{}", s),
            Self::Array(items) => {
                let texts: Vec<String> = items.iter().map(Scalar::marshal).collect();
                write!(f, "[{}]", texts.join(", "))
            }
        }
    }
}

// ------------- SQL conversions --------------
impl ToSql for Ciid {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}
impl FromSql for Ciid {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Ciid::from_str(text).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}
impl ToSql for LayerId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}
impl FromSql for LayerId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str().map(LayerId::from)
    }
}

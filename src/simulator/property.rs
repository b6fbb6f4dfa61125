//! Simulator property table
//!
//! Properties are loaded from a JSON array (order preserved) and addressed by
//! a normalized key: lowercase, spaces replaced by `_`, parentheses removed.
//! So `"Image Size X (pixels)"` is reachable as `image_size_x_pixels`, which is
//! also the identifier used inside get/set expressions.
//!
//! Writes follow these rules:
//! - A `set` expression replaces the incoming value before anything else
//! - Otherwise `ReadOnly` ignores the write, `Range` and `Set` ignore values
//!   outside their options, `AllowAll` accepts anything
//! - The accepted value is coerced per data type and stored as a string
//! - `set_also` expressions then write linked properties, bypassing
//!   value-type validation but still coercing
//!
//! A write with all its cascades is atomic: if any step fails the table is
//! restored to its state before the write.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::error::{DeError, Result};
use crate::protocol::codec::Parameter;
use crate::simulator::expr;

/// Maximum depth of `set_also` chains
const MAX_CASCADE_DEPTH: usize = 8;

/// Default table compiled into the crate
pub const DEFAULT_TABLE: &str = include_str!("properties.json");

/// Normalize a display name into a table key
///
/// # Examples
///
/// ```
/// use deapi::simulator::property::normalize_key;
///
/// assert_eq!(normalize_key("Image Size X (pixels)"), "image_size_x_pixels");
/// assert_eq!(normalize_key("Scan - Size X"), "scan_-_size_x");
/// ```
pub fn normalize_key(name: &str) -> String {
    name.trim()
        .replace(' ', "_")
        .to_lowercase()
        .replace(['(', ')'], "")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyDataType {
    String,
    Integer,
    Float,
    Boolean,
}

impl fmt::Display for PropertyDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PropertyDataType::String => "String",
            PropertyDataType::Integer => "Integer",
            PropertyDataType::Float => "Float",
            PropertyDataType::Boolean => "Boolean",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    #[serde(alias = "READ_ONLY", alias = "Read Only")]
    ReadOnly,
    Set,
    Range,
    AllowAll,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::ReadOnly => "ReadOnly",
            ValueType::Set => "Set",
            ValueType::Range => "Range",
            ValueType::AllowAll => "AllowAll",
        };
        f.write_str(s)
    }
}

/// A single server property
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Property {
    pub name: String,
    #[serde(deserialize_with = "scalar_string")]
    pub value: String,
    pub data_type: PropertyDataType,
    #[serde(default)]
    pub category: String,
    pub value_type: ValueType,
    /// Comma separated set members, or `"min,max"` for ranges
    #[serde(default)]
    pub options: Option<String>,
    #[serde(default, deserialize_with = "optional_scalar_string")]
    pub default_value: Option<String>,
    /// Expression computing the stored value from the written `value`
    #[serde(default, rename = "set")]
    pub set_expr: Option<String>,
    /// Expression computing the reported value
    #[serde(default, rename = "get")]
    pub get_expr: Option<String>,
    /// `(property, expression)` pairs written after this property changes
    #[serde(default)]
    pub set_also: Vec<(String, String)>,
}

fn scalar_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn scalar_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    serde_json::Value::deserialize(d).map(scalar_to_string)
}

fn optional_scalar_string<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<String>, D::Error> {
    Option::<serde_json::Value>::deserialize(d).map(|v| v.map(scalar_to_string))
}

impl Property {
    /// Numeric bounds of a `Range` property
    pub fn range(&self) -> Option<(f64, f64)> {
        if self.value_type != ValueType::Range {
            return None;
        }
        let options = self.options.as_deref()?;
        let mut it = options.split(',').map(|s| s.trim().parse::<f64>());
        match (it.next(), it.next()) {
            (Some(Ok(lo)), Some(Ok(hi))) => Some((lo, hi)),
            _ => None,
        }
    }

    /// Members of a `Set` property, without default markers or quotes
    pub fn option_list(&self) -> Vec<String> {
        self.options
            .as_deref()
            .map(|o| {
                o.split(',')
                    .map(|s| s.replace(['*', '\''], "").trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stored value converted to its data type
    pub fn typed(&self, raw: &str) -> Parameter {
        match self.data_type {
            PropertyDataType::String => Parameter::Str(raw.to_string()),
            PropertyDataType::Integer => Parameter::Str(raw.to_string())
                .to_i64()
                .map(Parameter::Int)
                .unwrap_or_else(|| Parameter::Str(raw.to_string())),
            PropertyDataType::Float => raw
                .trim()
                .parse::<f64>()
                .map(Parameter::Float)
                .unwrap_or_else(|_| Parameter::Str(raw.to_string())),
            PropertyDataType::Boolean => Parameter::Bool(parse_bool(raw)),
        }
    }

    fn accepts(&self, value: &Parameter) -> bool {
        match self.value_type {
            ValueType::ReadOnly => {
                warn!(property = %self.name, "Property is read only");
                false
            }
            ValueType::Range => match (self.range(), value.to_f64()) {
                (Some((lo, hi)), Some(v)) if v < lo || v > hi => {
                    warn!(property = %self.name, value = v, lo, hi, "Value out of range");
                    false
                }
                (Some(_), None) => {
                    warn!(property = %self.name, value = %value, "Value is not numeric");
                    false
                }
                _ => true,
            },
            ValueType::Set => {
                let options = self.option_list();
                if options.is_empty() || options.iter().any(|o| *o == value.to_string()) {
                    true
                } else {
                    warn!(property = %self.name, value = %value, options = ?options, "Value not in options");
                    false
                }
            }
            ValueType::AllowAll => true,
        }
    }

    fn coerce(&self, value: &Parameter) -> Result<String> {
        let invalid = || {
            DeError::InvalidParameter(format!(
                "{} expects {}, got `{}`",
                self.name, self.data_type, value
            ))
        };
        match self.data_type {
            PropertyDataType::String => Ok(value.to_string()),
            PropertyDataType::Integer => value
                .to_f64()
                .map(|v| (v as i64).to_string())
                .ok_or_else(invalid),
            PropertyDataType::Float => value.to_f64().map(|v| v.to_string()).ok_or_else(invalid),
            PropertyDataType::Boolean => Ok(match value {
                Parameter::Str(s) => parse_bool(s),
                other => other.to_f64().map(|v| v != 0.0).ok_or_else(invalid)?,
            }
            .to_string()),
        }
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "on" | "1" | "yes"
    )
}

/// Ordered table of properties
#[derive(Debug, Clone)]
pub struct PropertyTable {
    props: Vec<Property>,
    index: HashMap<String, usize>,
}

impl PropertyTable {
    /// Parse a JSON array of property objects
    ///
    /// # Errors
    ///
    /// - [`DeError::PropertyTable`] - Malformed JSON or unknown enum value
    /// - [`DeError::InvalidParameter`] - Two properties normalize to the same key
    pub fn from_json(json: &str) -> Result<Self> {
        let props: Vec<Property> = serde_json::from_str(json)?;
        Self::from_properties(props)
    }

    /// The table compiled into the crate
    pub fn builtin() -> Result<Self> {
        Self::from_json(DEFAULT_TABLE)
    }

    pub fn from_properties(props: Vec<Property>) -> Result<Self> {
        let mut index = HashMap::with_capacity(props.len());
        for (i, p) in props.iter().enumerate() {
            if index.insert(normalize_key(&p.name), i).is_some() {
                return Err(DeError::InvalidParameter(format!(
                    "duplicate property `{}`",
                    p.name
                )));
            }
        }
        debug!(count = props.len(), "Loaded property table");
        Ok(Self { props, index })
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Display names in table order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.props.iter().map(|p| p.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&normalize_key(name))
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.index
            .get(&normalize_key(name))
            .copied()
            .ok_or_else(|| DeError::UnknownProperty(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Result<&Property> {
        self.position(name).map(|i| &self.props[i])
    }

    /// Reported value as a string, applying the get expression if present
    pub fn value_string(&self, name: &str) -> Result<String> {
        let prop = self.get(name)?;
        match &prop.get_expr {
            Some(source) => {
                let v = expr::evaluate(source, |sym| {
                    if sym == "value" {
                        prop.value.trim().parse().ok()
                    } else {
                        self.stored_number(sym)
                    }
                })?;
                prop.coerce(&Parameter::Float(v))
            }
            None => Ok(prop.value.clone()),
        }
    }

    /// Reported value converted to its data type
    pub fn value(&self, name: &str) -> Result<Parameter> {
        let raw = self.value_string(name)?;
        Ok(self.get(name)?.typed(&raw))
    }

    /// Reported value as a number, if it has one
    pub fn number(&self, name: &str) -> Result<f64> {
        let raw = self.value_string(name)?;
        raw.trim().parse().map_err(|_| {
            DeError::InvalidParameter(format!("{} is not numeric: `{}`", name, raw))
        })
    }

    /// Stored value of a property referenced from an expression
    fn stored_number(&self, key: &str) -> Option<f64> {
        let p = &self.props[*self.index.get(key)?];
        p.value.trim().parse().ok()
    }

    /// Write a property, cascading linked writes
    ///
    /// Returns `Ok(false)` when validation silently rejected the value, in
    /// which case nothing changed.
    ///
    /// # Errors
    ///
    /// - [`DeError::UnknownProperty`] - No such property (in the write or a cascade)
    /// - [`DeError::InvalidParameter`] - Value cannot be coerced to the data type
    /// - [`DeError::Expression`] - A set or cascade expression failed
    ///
    /// The table is unchanged whenever an error is returned.
    pub fn set(&mut self, name: &str, value: &Parameter) -> Result<bool> {
        self.transaction(|table| table.write(name, value, false, 0))
    }

    /// Write several properties as one atomic unit
    pub fn set_many(&mut self, writes: &[(&str, Parameter)]) -> Result<bool> {
        self.transaction(|table| {
            let mut all = true;
            for (name, value) in writes {
                all &= table.write(name, value, false, 0)?;
            }
            Ok(all)
        })
    }

    /// Overwrite a stored value without validation or cascades
    pub fn assign(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        let i = self.position(name)?;
        self.props[i].value = value.into();
        Ok(())
    }

    /// `(name, reported value)` for every property, in table order
    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.props
            .iter()
            .map(|p| {
                let v = self.value_string(&p.name).unwrap_or_else(|_| p.value.clone());
                (p.name.clone(), v)
            })
            .collect()
    }

    fn transaction<F>(&mut self, f: F) -> Result<bool>
    where
        F: FnOnce(&mut Self) -> Result<bool>,
    {
        let saved = self.props.clone();
        match f(self) {
            Ok(applied) => Ok(applied),
            Err(e) => {
                warn!(error = %e, "Property write rolled back");
                self.props = saved;
                Err(e)
            }
        }
    }

    fn write(&mut self, name: &str, value: &Parameter, cascade: bool, depth: usize) -> Result<bool> {
        if depth > MAX_CASCADE_DEPTH {
            return Err(DeError::Expression {
                expr: name.to_string(),
                reason: "set_also chain too deep".to_string(),
            });
        }
        let i = self.position(name)?;

        let resolved = match self.props[i].set_expr.clone() {
            Some(source) => {
                let incoming = value.to_f64();
                let v = expr::evaluate(&source, |sym| {
                    if sym == "value" {
                        incoming
                    } else {
                        self.stored_number(sym)
                    }
                })?;
                Parameter::Float(v)
            }
            None if !cascade && !self.props[i].accepts(value) => return Ok(false),
            None => value.clone(),
        };

        let stored = self.props[i].coerce(&resolved)?;
        debug!(property = %self.props[i].name, value = %stored, cascade, "Property set");
        self.props[i].value = stored.clone();

        let written: Option<f64> = stored.trim().parse().ok();
        for (target, source) in self.props[i].set_also.clone() {
            let v = expr::evaluate(&source, |sym| {
                if sym == "value" {
                    written
                } else {
                    self.stored_number(sym)
                }
            })?;
            self.write(&target, &Parameter::Float(v), true, depth + 1)?;
        }
        Ok(true)
    }
}

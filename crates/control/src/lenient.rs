//! Deserializers for numeric fields that arrive as numbers or numeric strings

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;

fn number_from_value<E: de::Error>(value: Value) -> Result<Option<f64>, E> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| E::custom("number out of range")),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| E::custom(format!("expected a number, got \"{}\"", s))),
        other => Err(E::custom(format!("expected a number, got {}", other))),
    }
}

/// `30`, `30.0`, `"30"` → `Some(30)`; `null` or `""` → `None`
pub fn opt_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    match number_from_value::<D::Error>(Value::deserialize(deserializer)?)? {
        None => Ok(None),
        Some(n) if n >= 0.0 && n <= u32::MAX as f64 => Ok(Some(n.round() as u32)),
        Some(n) => Err(de::Error::custom(format!("{} is not a valid duration", n))),
    }
}

/// `10`, `"10"`, `2.5` → seconds as `f64`; `null` or `""` → `None`
pub fn opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match number_from_value::<D::Error>(Value::deserialize(deserializer)?)? {
        Some(n) if n < 0.0 || !n.is_finite() => {
            Err(de::Error::custom(format!("{} is not a valid value", n)))
        }
        other => Ok(other),
    }
}

//! Shared Serde deserializers
//!
//! Configuration values arrive from YAML as well as from flat environment
//! variables, so the same field may be a native value or a string:
//! - booleans: `true`, `1`, `"yes"`, `"False"`
//! - unit id lists: `[1, 2]`, `"1,2"`, `1`
//! - optional paths: `null` or `""` mean unset

use serde::{Deserialize, Deserializer};
use std::path::PathBuf;

/// Boolean accepting native booleans, 0/1 and common string spellings
///
/// Strings are compared case-insensitively: `"1"`/`"0"`, `"true"`/`"false"`,
/// `"yes"`/`"no"`, `"on"`/`"off"`.
pub fn deserialize_bool_flexible<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrStringOrInt {
        Bool(bool),
        Int(i64),
        String(String),
    }

    match BoolOrStringOrInt::deserialize(deserializer)? {
        BoolOrStringOrInt::Bool(b) => Ok(b),
        BoolOrStringOrInt::Int(i) => match i {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(D::Error::custom(format!(
                "Invalid integer value {}, expected 0 or 1",
                i
            ))),
        },
        BoolOrStringOrInt::String(s) => parse_bool(&s).ok_or_else(|| {
            D::Error::custom(format!(
                "Invalid boolean value '{}', expected: 1/0, true/false, yes/no, on/off",
                s
            ))
        }),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    let t = s.trim();
    if t == "1"
        || t.eq_ignore_ascii_case("true")
        || t.eq_ignore_ascii_case("yes")
        || t.eq_ignore_ascii_case("on")
    {
        Some(true)
    } else if t == "0"
        || t.eq_ignore_ascii_case("false")
        || t.eq_ignore_ascii_case("no")
        || t.eq_ignore_ascii_case("off")
    {
        Some(false)
    } else {
        None
    }
}

/// Modbus unit id list from a sequence, a comma separated string or a single id
///
/// Blank entries are skipped, so `"1, 2,"` yields `[1, 2]` and `""` an empty
/// list.
pub fn deserialize_unit_ids<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdEntry {
        Int(i64),
        String(String),
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdList {
        List(Vec<IdEntry>),
        Single(i64),
        Text(String),
    }

    fn to_unit_id<E: Error>(value: i64) -> Result<u8, E> {
        u8::try_from(value).map_err(|_| E::custom(format!("unit id {value} out of range")))
    }

    fn parse_text<E: Error>(text: &str) -> Result<Vec<u8>, E> {
        text.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<i64>()
                    .map_err(|_| E::custom(format!("invalid unit id '{part}'")))
                    .and_then(to_unit_id)
            })
            .collect()
    }

    match IdList::deserialize(deserializer)? {
        IdList::Single(id) => Ok(vec![to_unit_id(id)?]),
        IdList::Text(text) => parse_text(&text),
        IdList::List(entries) => {
            let mut ids = Vec::with_capacity(entries.len());
            for entry in entries {
                match entry {
                    IdEntry::Int(id) => ids.push(to_unit_id(id)?),
                    IdEntry::String(text) => ids.extend(parse_text::<D::Error>(&text)?),
                }
            }
            Ok(ids)
        },
    }
}

/// Optional path where an empty string also means unset
pub fn deserialize_optional_path<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from))
}

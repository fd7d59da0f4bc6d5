//! Structured resource identifiers.
//!
//! A [`Uri`] has the textual form `type://path?key=value&key=value`. Options are
//! kept sorted by key, so the serialized form is canonical and two identifiers
//! compare equal exactly when their type, path and options are equal.
//!
//! Escaping rules:
//! - in the path, `\` and `?` are written as `\\` and `\?`
//! - in option keys and values, `\`, `=` and `&` are written as `\\`, `\=` and `\&`

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::path::Path;
use std::str::{CharIndices, FromStr};
use thiserror::Error;

use crate::unique_id::UniqueId;

/// Option carrying the unique ID of a playlist entry.
pub const ID_OPTION: &str = "id";
/// Option selecting one track inside a multi-track container.
pub const SUB_RESOURCE_INDEX_OPTION: &str = "sub_resource_index";

const SEPARATOR: &str = "://";
const PATH_SPECIALS: &[char] = &['\\', '?'];
const OPTION_SPECIALS: &[char] = &['\\', '=', '&'];

/// Errors produced while building or parsing a [`Uri`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UriError {
    #[error("resource identifier {0:?} has no \"://\" separator")]
    MissingSeparator(String),
    #[error("resource type {0:?} must not contain \"://\"")]
    InvalidType(String),
    #[error("stray backslash at byte {offset} of {input:?}")]
    StrayBackslash { input: String, offset: usize },
    #[error("option {key:?} in {input:?} has more than one unescaped '='")]
    DuplicateValueMarker { input: String, key: String },
}

/// Immutable, comparable resource address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uri {
    kind: String,
    path: String,
    options: BTreeMap<String, String>,
}

impl Uri {
    pub fn new(kind: impl Into<String>, path: impl Into<String>) -> Result<Self, UriError> {
        let kind = kind.into();
        if kind.contains(SEPARATOR) {
            return Err(UriError::InvalidType(kind));
        }
        Ok(Self {
            kind,
            path: path.into(),
            options: BTreeMap::new(),
        })
    }

    /// `file://` identifier for a local path.
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            kind: "file".to_string(),
            path: path.as_ref().to_string_lossy().into_owned(),
            options: BTreeMap::new(),
        }
    }

    /// The resource type (the part before `://`).
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn set_option(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.options.insert(key.into(), value.into())
    }

    pub fn remove_option(&mut self, key: &str) -> Option<String> {
        self.options.remove(key)
    }

    /// Unique ID stored in the `id` option, if present and numeric.
    pub fn unique_id(&self) -> Option<UniqueId> {
        self.option(ID_OPTION)?.parse().ok()
    }

    pub fn with_unique_id(self, id: UniqueId) -> Self {
        self.with_option(ID_OPTION, id.to_string())
    }

    pub fn sub_resource_index(&self) -> Option<u64> {
        self.option(SUB_RESOURCE_INDEX_OPTION)?.parse().ok()
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.kind)?;
        f.write_str(SEPARATOR)?;
        write_escaped(f, &self.path, PATH_SPECIALS)?;
        for (index, (key, value)) in self.options.iter().enumerate() {
            f.write_char(if index == 0 { '?' } else { '&' })?;
            write_escaped(f, key, OPTION_SPECIALS)?;
            f.write_char('=')?;
            write_escaped(f, value, OPTION_SPECIALS)?;
        }
        Ok(())
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, text: &str, specials: &[char]) -> fmt::Result {
    for c in text.chars() {
        if specials.contains(&c) {
            f.write_char('\\')?;
        }
        f.write_char(c)?;
    }
    Ok(())
}

impl FromStr for Uri {
    type Err = UriError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = input
            .split_once(SEPARATOR)
            .ok_or_else(|| UriError::MissingSeparator(input.to_string()))?;
        let base = kind.len() + SEPARATOR.len();

        let mut chars = rest.char_indices();
        let mut path = String::new();
        let mut has_options = false;
        while let Some((offset, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, escaped @ ('\\' | '?'))) => path.push(escaped),
                    _ => {
                        return Err(UriError::StrayBackslash {
                            input: input.to_string(),
                            offset: base + offset,
                        })
                    }
                },
                '?' => {
                    has_options = true;
                    break;
                }
                other => path.push(other),
            }
        }

        let mut options = BTreeMap::new();
        if has_options {
            parse_options(input, base, chars, &mut options)?;
        }

        Ok(Self {
            kind: kind.to_string(),
            path,
            options,
        })
    }
}

fn parse_options(
    input: &str,
    base: usize,
    mut chars: CharIndices<'_>,
    options: &mut BTreeMap<String, String>,
) -> Result<(), UriError> {
    let mut key = String::new();
    let mut value: Option<String> = None;

    while let Some((offset, c)) = chars.next() {
        match c {
            '\\' => {
                let escaped = match chars.next() {
                    Some((_, escaped @ ('\\' | '=' | '&'))) => escaped,
                    _ => {
                        return Err(UriError::StrayBackslash {
                            input: input.to_string(),
                            offset: base + offset,
                        })
                    }
                };
                match value.as_mut() {
                    Some(value) => value.push(escaped),
                    None => key.push(escaped),
                }
            }
            '=' => {
                if value.is_some() {
                    return Err(UriError::DuplicateValueMarker {
                        input: input.to_string(),
                        key,
                    });
                }
                value = Some(String::new());
            }
            '&' => flush_option(&mut key, &mut value, options),
            other => match value.as_mut() {
                Some(value) => value.push(other),
                None => key.push(other),
            },
        }
    }
    flush_option(&mut key, &mut value, options);
    Ok(())
}

fn flush_option(
    key: &mut String,
    value: &mut Option<String>,
    options: &mut BTreeMap<String, String>,
) {
    let value = value.take();
    if key.is_empty() && value.is_none() {
        return;
    }
    options.insert(std::mem::take(key), value.unwrap_or_default());
}

impl Serialize for Uri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Uri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

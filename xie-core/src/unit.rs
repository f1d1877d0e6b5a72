//! The atomic element of bi-scriptal text.
//!
//! A [`CharUnit`] is either a plain character (`{"glyph":"A"}`) or an
//! ideograph paired with its phonetic reading (`{"glyph":"狗","reading":"gou3"}`).
//! Every document text is a `Vec<CharUnit>`, and every insertion carried by a
//! change set is a single unit.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CharUnitError {
    #[error("glyph must be exactly one codepoint, got {0:?}")]
    InvalidGlyph(String),
}

/// One character of document text.
///
/// The glyph is always exactly one Unicode scalar value. The reading, when
/// present, is the transcription of that glyph (Pinyin with a trailing tone
/// digit), e.g. `gou3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawCharUnit")]
pub struct CharUnit {
    glyph: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reading: Option<String>,
}

/// Unchecked wire shape; validated into a [`CharUnit`] on deserialization.
#[derive(Deserialize)]
struct RawCharUnit {
    glyph: String,
    #[serde(default)]
    reading: Option<String>,
}

impl TryFrom<RawCharUnit> for CharUnit {
    type Error = CharUnitError;

    fn try_from(raw: RawCharUnit) -> Result<Self, Self::Error> {
        match raw.reading {
            Some(reading) => CharUnit::with_reading(raw.glyph, reading),
            None => CharUnit::new(raw.glyph),
        }
    }
}

impl CharUnit {
    /// Create a plain unit with no reading.
    pub fn new(glyph: impl Into<String>) -> Result<Self, CharUnitError> {
        let glyph = glyph.into();
        Self::check_glyph(&glyph)?;
        Ok(Self { glyph, reading: None })
    }

    /// Create a paired unit. An empty reading is stored as no reading.
    pub fn with_reading(
        glyph: impl Into<String>,
        reading: impl Into<String>,
    ) -> Result<Self, CharUnitError> {
        let glyph = glyph.into();
        Self::check_glyph(&glyph)?;
        let reading = reading.into();
        Ok(Self {
            glyph,
            reading: (!reading.is_empty()).then_some(reading),
        })
    }

    /// Build a plain unit from a `char`; cannot fail.
    pub fn from_char(c: char) -> Self {
        Self {
            glyph: c.to_string(),
            reading: None,
        }
    }

    fn check_glyph(glyph: &str) -> Result<(), CharUnitError> {
        let mut chars = glyph.chars();
        match (chars.next(), chars.next()) {
            (Some(_), None) => Ok(()),
            _ => Err(CharUnitError::InvalidGlyph(glyph.to_string())),
        }
    }

    pub fn glyph(&self) -> &str {
        &self.glyph
    }

    pub fn reading(&self) -> Option<&str> {
        self.reading.as_deref()
    }
}

/// Glyph first; on equal glyphs a unit *with* a reading sorts before one
/// without, and two readings compare lexicographically.
impl Ord for CharUnit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.glyph.cmp(&other.glyph).then_with(|| {
            match (&self.reading, &other.reading) {
                (Some(a), Some(b)) => a.cmp(b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        })
    }
}

impl PartialOrd for CharUnit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CharUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.glyph)
    }
}

/// Convert a plain string into text, one reading-less unit per `char`.
pub fn text_from_str(s: &str) -> Vec<CharUnit> {
    s.chars().map(CharUnit::from_char).collect()
}

/// Concatenate the glyphs of a text, dropping readings.
pub fn text_to_string(text: &[CharUnit]) -> String {
    text.iter().map(CharUnit::glyph).collect()
}

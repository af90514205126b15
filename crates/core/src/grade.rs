//! Priority grades.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ModelError, Result};

/// Single-letter priority code of a queued job.
///
/// Uppercase grades rank above lowercase ones and each case is ordered
/// alphabetically, so `'A'` is the highest grade and `'z'` the lowest. This
/// is exactly ASCII order, which the derived `Ord` relies on: a smaller
/// grade is a more urgent one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "char", into = "char")]
pub struct Grade(char);

impl Grade {
    /// Highest possible grade.
    pub const HIGHEST: Grade = Grade('A');

    /// Lowest possible grade.
    pub const LOWEST: Grade = Grade('z');

    /// Grade reserved for data files that will become execute files.
    pub const EXECUTE: Grade = Grade('X');

    /// Grade used when a submitter does not pick one.
    pub const DEFAULT: Grade = Grade('N');

    /// Create a grade, rejecting anything but an ASCII letter.
    pub fn new(c: char) -> Result<Self> {
        if c.is_ascii_alphabetic() {
            Ok(Self(c))
        } else {
            Err(ModelError::InvalidGrade(c.to_string()))
        }
    }

    /// The grade letter.
    pub fn as_char(self) -> char {
        self.0
    }

    /// Uppercase grades bypass throttling and are always admitted.
    pub fn is_unthrottled(self) -> bool {
        self.0.is_ascii_uppercase()
    }

    /// Whether a scan with minimum grade `min` admits this grade.
    ///
    /// Uppercase grades are always admitted; lowercase grades only when they
    /// are lexicographically `<= min`.
    pub fn admitted_by(self, min: Grade) -> bool {
        self.is_unthrottled() || self.0 <= min.0
    }
}

impl Default for Grade {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<char> for Grade {
    type Error = ModelError;

    fn try_from(c: char) -> Result<Self> {
        Self::new(c)
    }
}

impl From<Grade> for char {
    fn from(grade: Grade) -> char {
        grade.0
    }
}

impl FromStr for Grade {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::new(c),
            _ => Err(ModelError::InvalidGrade(s.to_string())),
        }
    }
}

//! Field-qualified terms.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A term of an indexed field. Terms order by field first, then by bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term {
    field: String,
    bytes: Vec<u8>,
}

impl Term {
    pub fn new<F: Into<String>, B: Into<Vec<u8>>>(field: F, bytes: B) -> Self {
        Term {
            field: field.into(),
            bytes: bytes.into(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The term's bytes as text, if they are valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    pub fn ram_bytes_used(&self) -> u64 {
        (self.field.len() + self.bytes.len()) as u64
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.text() {
            Some(text) => write!(f, "{}:{}", self.field, text),
            None => write!(f, "{}:{:?}", self.field, self.bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_field_then_bytes() {
        let mut terms = vec![
            Term::new("title", "a"),
            Term::new("id", "7"),
            Term::new("id", "10"),
        ];
        terms.sort();
        assert_eq!(
            terms,
            vec![
                Term::new("id", "10"),
                Term::new("id", "7"),
                Term::new("title", "a"),
            ]
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Term::new("id", "7").to_string(), "id:7");
        assert_eq!(Term::new("raw", vec![0xff]).to_string(), "raw:[255]");
    }
}

//! Prefix-compressed, sorted term lists.
//!
//! Each term is encoded relative to the previous one:
//!
//! ```text
//! varint(shared_prefix << 1 | field_changed)
//! [varint(field_len) field_bytes]   only when field_changed
//! varint(suffix_len) suffix_bytes
//! ```
//!
//! Frozen packets hold their delete terms in this form; they are only ever
//! iterated front to back.

use crate::error::{PalisadeError, Result};
use crate::update::Term;
use crate::util::varint;

/// Immutable prefix-coded term list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixCodedTerms {
    bytes: Vec<u8>,
    size: usize,
}

impl PrefixCodedTerms {
    pub fn builder() -> PrefixCodedTermsBuilder {
        PrefixCodedTermsBuilder::default()
    }

    /// Number of terms.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn ram_bytes_used(&self) -> u64 {
        self.bytes.capacity() as u64 + 24
    }

    pub fn iter(&self) -> TermIterator<'_> {
        TermIterator {
            bytes: &self.bytes,
            pos: 0,
            remaining: self.size,
            field: String::new(),
            term: Vec::new(),
        }
    }
}

/// Builds a [`PrefixCodedTerms`] from terms added in strictly increasing order.
#[derive(Debug, Default)]
pub struct PrefixCodedTermsBuilder {
    bytes: Vec<u8>,
    size: usize,
    last: Option<Term>,
}

impl PrefixCodedTermsBuilder {
    pub fn add(&mut self, term: &Term) -> Result<()> {
        let (prefix, field_changed) = match &self.last {
            Some(last) => {
                if term <= last {
                    return Err(PalisadeError::invalid_argument(format!(
                        "terms must be added in increasing order: {term} after {last}"
                    )));
                }
                let prefix = last
                    .bytes()
                    .iter()
                    .zip(term.bytes())
                    .take_while(|(a, b)| a == b)
                    .count();
                (prefix, last.field() != term.field())
            }
            None => (0, true),
        };

        varint::write_u64(&mut self.bytes, ((prefix as u64) << 1) | field_changed as u64);
        if field_changed {
            varint::write_u64(&mut self.bytes, term.field().len() as u64);
            self.bytes.extend_from_slice(term.field().as_bytes());
        }
        let suffix = &term.bytes()[prefix..];
        varint::write_u64(&mut self.bytes, suffix.len() as u64);
        self.bytes.extend_from_slice(suffix);

        self.size += 1;
        self.last = Some(term.clone());
        Ok(())
    }

    pub fn finish(mut self) -> PrefixCodedTerms {
        self.bytes.shrink_to_fit();
        PrefixCodedTerms {
            bytes: self.bytes,
            size: self.size,
        }
    }
}

/// Decodes terms in order.
#[derive(Debug)]
pub struct TermIterator<'a> {
    bytes: &'a [u8],
    pos: usize,
    remaining: usize,
    field: String,
    term: Vec<u8>,
}

impl TermIterator<'_> {
    fn read_slice(&mut self, len: usize) -> Result<&[u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.bytes.len());
        let end = end.ok_or_else(|| {
            PalisadeError::serialization(format!(
                "prefix coded term of {len} bytes at offset {} overruns the buffer",
                self.pos
            ))
        })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn decode(&mut self) -> Result<Term> {
        let code = varint::read_u64(self.bytes, &mut self.pos)?;
        if code & 1 == 1 {
            let len = varint::read_u64(self.bytes, &mut self.pos)? as usize;
            let field = self.read_slice(len)?.to_vec();
            self.field = String::from_utf8(field)
                .map_err(|e| PalisadeError::serialization(format!("invalid field name: {e}")))?;
        }
        let prefix = (code >> 1) as usize;
        if prefix > self.term.len() {
            return Err(PalisadeError::serialization(format!(
                "shared prefix {prefix} longer than previous term ({} bytes)",
                self.term.len()
            )));
        }
        let suffix_len = varint::read_u64(self.bytes, &mut self.pos)? as usize;
        let suffix = self.read_slice(suffix_len)?.to_vec();
        self.term.truncate(prefix);
        self.term.extend_from_slice(&suffix);
        Ok(Term::new(self.field.clone(), self.term.clone()))
    }
}

impl Iterator for TermIterator<'_> {
    type Item = Result<Term>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let term = self.decode();
        if term.is_err() {
            self.remaining = 0;
        }
        Some(term)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(terms: &[Term]) -> PrefixCodedTerms {
        let mut builder = PrefixCodedTerms::builder();
        for term in terms {
            builder.add(term).unwrap();
        }
        builder.finish()
    }

    #[test]
    fn test_terms_decode_in_order() {
        let terms = vec![
            Term::new("body", "apple"),
            Term::new("body", "applesauce"),
            Term::new("body", "banana"),
            Term::new("id", "7"),
            Term::new("id", "70"),
        ];
        let coded = build(&terms);
        assert_eq!(coded.size(), 5);

        let decoded: Vec<Term> = coded.iter().collect::<Result<_>>().unwrap();
        assert_eq!(decoded, terms);
    }

    #[test]
    fn test_shared_prefixes_shrink_the_encoding() {
        let terms: Vec<Term> = (0..50)
            .map(|i| Term::new("uuid", format!("0000-0000-0000-{i:04}")))
            .collect();
        let coded = build(&terms);
        let raw: usize = terms.iter().map(|t| t.bytes().len()).sum();
        assert!(coded.ram_bytes_used() < raw as u64);
    }

    #[test]
    fn test_rejects_unsorted_and_duplicate_terms() {
        let mut builder = PrefixCodedTerms::builder();
        builder.add(&Term::new("id", "b")).unwrap();
        assert!(builder.add(&Term::new("id", "a")).is_err());
        assert!(builder.add(&Term::new("id", "b")).is_err());
        assert!(builder.add(&Term::new("a_field", "z")).is_err());
    }

    #[test]
    fn test_empty() {
        let coded = PrefixCodedTerms::builder().finish();
        assert!(coded.is_empty());
        assert_eq!(coded.iter().count(), 0);
    }
}

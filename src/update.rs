//! Buffered deletes and doc-values updates.
//!
//! Updates flow through three stages:
//!
//! 1. [`BufferedUpdates`] accumulates term deletes, query deletes and field
//!    updates in RAM, each with the doc-id cutoff it applies below.
//! 2. [`BufferedUpdates::freeze`] compacts them into an immutable
//!    [`FrozenBufferedUpdates`] packet, which [`BufferedUpdatesStream::push`]
//!    stamps with a global generation.
//! 3. [`FrozenBufferedUpdates::apply`] resolves the packet against every
//!    registry entry whose generation lags behind it.

pub mod buffered;
pub mod doc_values;
pub mod frozen;
pub mod prefix_coded;
pub mod query;
pub mod stream;
pub mod term;

pub use buffered::BufferedUpdates;
pub use doc_values::{DocValuesFieldUpdates, DocValuesType, FieldUpdate, FieldUpdatesBuffer, UpdateValue};
pub use frozen::{ApplyResult, FrozenBufferedUpdates};
pub use prefix_coded::{PrefixCodedTerms, PrefixCodedTermsBuilder};
pub use query::{DeleteQuery, DocValuesExistsQuery, MatchAllDocsQuery, TermQuery};
pub use stream::BufferedUpdatesStream;
pub use term::Term;

/// Estimated heap cost of one buffered delete term, excluding its bytes.
pub const BYTES_PER_DEL_TERM: u64 = 96;

/// Estimated heap cost of one buffered delete query.
pub const BYTES_PER_DEL_QUERY: u64 = 88;

/// Estimated heap cost of one buffered field update, excluding term and value.
pub const BYTES_PER_FIELD_UPDATE: u64 = 64;

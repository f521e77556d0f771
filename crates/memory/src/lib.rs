//! Memory for contextloop: the short-term store, long-term extraction, and
//! the versioned global profile.

pub mod in_memory;
pub mod long_term;
pub mod profile;
pub mod short_term;

pub use in_memory::{InMemoryLongTermStore, InMemoryProfileStore, InMemoryTurnLog};
pub use long_term::{ExtractionReport, LongTermExtractor};
pub use profile::{DELETE_SENTINEL, KNOWN_FIELDS, apply_profile_patch, merge_patch};
pub use short_term::{RetentionPolicy, ShortTermStore, ShortTermView, render_transcript};

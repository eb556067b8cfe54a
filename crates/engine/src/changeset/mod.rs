//! Change-set model
//!
//! A unit of work describes its modifications as a [`UnitOfWorkChangeSet`]:
//! one [`ObjectChangeSet`] per touched object, each holding
//! [`ChangeRecord`]s keyed by attribute. Merges apply change sets instead of
//! re-diffing whole objects.

pub mod codec;
pub mod diff;
pub mod object;
pub mod record;
pub mod unit;

pub use codec::ChangeSetCodecError;
pub use diff::ChangeContext;
pub use object::ObjectChangeSet;
pub use record::{AttributeChange, ChangeRecord, ChangeSetId};
pub use unit::UnitOfWorkChangeSet;

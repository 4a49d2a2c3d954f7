//! Integration scheduler.
//!
//! The [`Director`] periodically (or on demand) reads the merge
//! [`Manifest`], hands every ready branch to an [`Integrator`], and moves the
//! manifest's main head after each successful merge. Each step is published
//! as an event on the [`DIRECTOR_STREAM`] stream.

mod director;
mod error;
mod manifest;

pub use director::{
    CycleOutcome, CycleReport, DIRECTOR_STREAM, Director, FailedItem, IntegratedItem, Integrator,
    Merged, Trigger,
};
pub use error::{BoxError, DirectorError, ManifestError, Result};
pub use manifest::{FileManifestManager, Manifest, ManifestManager, MergeRecord, ReadyItem};

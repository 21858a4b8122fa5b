//! Client-side reconciliation of the batch event stream.
//!
//! An observer keeps a [`ReadModel`] of one campaign: the job it is
//! following, the contact list, and the contact an operator has selected.
//! Events are merged into it with the rules in [`merge`]; anything the
//! stream cannot fill in (lag, reconnects, unknown contacts) is repaired by
//! a snapshot through a [`SnapshotSource`].
//!
//! | Module       | Responsibility                                          |
//! |--------------|---------------------------------------------------------|
//! | `read_model` | View types, `apply`, `resync`, selection, local edits   |
//! | `merge`      | Per-event field merges                                  |
//! | `follower`   | Drives a model from a stream, resyncs on gaps           |

pub mod follower;
pub mod merge;
pub mod read_model;

pub use follower::{DbSnapshotSource, Follower, HttpSnapshotSource, SnapshotSource};
pub use read_model::{Applied, ContactPatch, ContactView, JobView, ReadModel};

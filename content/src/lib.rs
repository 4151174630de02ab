//! # OCI content
//!
//! Content-addressed blobs and image manifests, and the machinery to move
//! them between places safely.
//!
//! Anything content can live in implements [`Target`]: the stores in this
//! crate, and remote repositories elsewhere. The [`copy`] engine moves a
//! manifest graph between any two targets, verifying digests on both ends and
//! publishing the manifest only after every blob it references is in place.

mod config;
pub mod copy;
mod descriptor;
pub mod digest;
mod error;
pub mod gc;
pub mod graph;
pub mod manifest;
pub mod store;
mod target;
pub mod verify;

pub use config::StoreConfig;
pub use copy::{copy, copy_graph, CopyOptions, CopyReport};
pub use descriptor::{Descriptor, ANNOTATION_CREATED, ANNOTATION_REF_NAME};
pub use digest::{Algorithm, Digest, Digester};
pub use error::{Error, ErrorKind, Result};
pub use manifest::Manifest;
pub use store::{Inventory, LocalStore, MemoryStore};
pub use target::{parse_reference, validate_tag, BoxReader, Reader, Target};
pub use verify::{fetch_all, DigestReader, DigestWriter};

//! Variant Registry
//!
//! Capability negotiation and content-addressed transform orchestration
//! for manifests composed of typed blocks.
//!
//! ## Features
//!
//! - **Composed Registry**: block-kind rules merged from a base document
//!   plus extensions and overrides, validated all-or-nothing, installed as
//!   an immutable versioned snapshot
//! - **Capability Negotiation**: deterministic selection of the best
//!   representation for a client's accept list and sizing hints
//! - **Idempotent Transforms**: content-addressed job identity, at most
//!   one in-flight job per key, bounded retries with backoff
//! - **Mandatory Provenance**: every generated representation records its
//!   content hash, tool, version, and timestamp
//!
//! ## Architecture
//!
//! ```text
//! (block, capability statement)
//!        │
//!        ▼
//!  VariantResolver ──── reads ───▶ RegistryStore ◀── installs ── Composer
//!        │                          (atomic snapshot swap)
//!        ├─ Selected(representation)
//!        ├─ Unsatisfiable
//!        ▼
//!  NeedsTransform(request)
//!        │
//!        ▼
//!  TransformScheduler ── dedup by TransformKey ──▶ Runner
//!        │                                           │
//!        └──── Representation (with provenance) ◀────┘
//! ```

pub mod address;
pub mod capability;
pub mod checksum;
pub mod compose;
pub mod config;
pub mod error;
pub mod media;
pub mod registry;
pub mod representation;
pub mod resolver;
pub mod runner;
pub mod scheduler;
pub mod transform;

pub use address::VariantPath;
pub use capability::{AcceptPattern, CapabilityStatement, Hints, NetworkClass};
pub use checksum::ContentHash;
pub use compose::{ComposeDoc, Composer, SchemaResolver};
pub use error::{CompositionError, RunnerError, SourceError, TransformError};
pub use media::{MediaType, MediaTypePattern};
pub use registry::{
    CachePolicy, KindId, RegistryEntry, RegistrySnapshot, RegistrySource, RegistryStore,
    TransformRule,
};
pub use representation::{PayloadSource, Representation, ToolVersion};
pub use resolver::{FitPolicy, Resolution, VariantResolver};
pub use runner::{JobSpec, RunLimits, Runner, RunnerCatalog, RunnerOutput};
pub use scheduler::{RetryPolicy, TransformHandle, TransformScheduler};
pub use transform::{JobState, ToolImage, TransformJob, TransformKey, TransformRequest};

#![deny(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Job orchestration engine for `pdbsim` (cascading phase search, candidate
//! detail computation, live result streaming).

/// Public API for the engine crate.
pub mod api;

mod alignment;
mod backend;
mod engine;
mod phase;
mod pool;
mod registry;
mod store;
mod stream;
mod worker;

pub use alignment::{
    Aligner, Alignment, AlignmentMatrix, CommandVisualizer, ExternalAligner, RenderRequest,
    Visualizer,
};
pub use api::{
    CandidateEntry, EngineConfig, EngineError, JobDescriptor, JobId, JobStatus, Phase,
    PhaseState, SearchRequest, StreamFrame, UpdateFrame,
};
pub use backend::{BackendConfig, BackendError, HttpBackend, SearchBackend};
pub use engine::{Collaborators, JobSubscription, MIN_QUERY_CHAIN_RESIDUES, SearchEngine};
pub use registry::{InMemoryJobRegistry, JobRegistry, RegistryError};
pub use store::{ChainInfo, MemoryStore, StructureStore};

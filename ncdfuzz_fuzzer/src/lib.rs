//! ncdfuzz corpus curation: decide, after every target execution, whether
//! the input is kept, where it is filed in the per-edge reservoir, and who
//! gets evicted when a reservoir slot is full.
//!
//! The pipeline per execution is: classify the trace, grade it against the
//! virgin maps, file it into the edge reservoir (or the legacy queue), and
//! triage crash and timeout outcomes into their artefact directories. Set
//! diversity over LZ4 lengths drives eviction so the retained corpus spans
//! the input space instead of clustering near a few seeds.

pub mod config;
pub mod describe;
pub mod exec;
pub mod favored;
pub mod feedback;
pub mod manager;
pub mod partition;
pub mod queue;
pub mod reservoir;
pub mod stats;

pub use config::{Config, DiversityAtom, HashfuzzConfig};
pub use exec::Fault;
pub use manager::{CorpusManager, SaveVerdict};

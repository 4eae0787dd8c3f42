//! Persistence for the pipeline
//!
//! Two stores back the processor:
//! - `Database`: SQLite rows for sessions and transcript chunks
//! - `FragmentStore`: raw fragment files on disk, the source of truth for
//!   crash recovery until a chunk is transcribed

mod db;
mod fragments;

pub use db::{ChunkRow, Database, SessionRow};
pub use fragments::{fragment_receive_time, FragmentStore};

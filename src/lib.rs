//! streaming-attn-ctx: an online KV cache manager for streaming
//! long-context attention.
//!
//! The crate is organized leaf-first, one module per pipeline component:
//!
//! - [`tensor`]: the host-resident shaped-buffer substrate every other
//!   module operates on.
//! - [`transfer`]: one-shot async host↔device tensor moves.
//! - [`cache`]: the paged block store, representative index, top-k
//!   selector, and global-buffer assembler.
//! - [`attn`]: the external multi-stage attention and rotary-embedding
//!   contracts (plus a CPU reference implementation of each).
//! - [`orchestrator`]: [`Orchestrator`], which drives the whole pipeline.
//! - [`config`]: construction parameters and CLI/file loading.
//! - [`error`]: the manager's consolidated error taxonomy.
//! - [`server`]: a thin HTTP harness for driving the manager standalone.

pub mod attn;
pub mod cache;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod server;
pub mod tensor;
pub mod transfer;

pub use config::{CacheStrategy, Cli, Config, ManagerConfig};
pub use error::{ManagerError, ManagerResult};
pub use orchestrator::Orchestrator;
pub use tensor::DeviceTensor;

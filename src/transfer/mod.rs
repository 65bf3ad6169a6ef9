//! Host↔device transfer machinery.
//!
//! - [`transfer_handle`]: the one-shot `Pending`/`Ready` tensor move
//!   contract
//! - [`gpu_transfer`]: the underlying async copy engine

pub mod gpu_transfer;
pub mod transfer_handle;

pub use gpu_transfer::{GpuTransferEngine, TransferDirection};
pub use transfer_handle::TransferHandle;

//! Device ↔ host copy engine backing [`super::transfer_handle::TransferHandle`].
//!
//! Stands in for the accelerator's async memcpy engine. Real deployments
//! would issue `cudaMemcpyAsync`-style calls here; this engine just moves
//! [`DeviceTensor`] data and tracks transfer statistics, since the
//! contract only cares that the copy is non-blocking to enqueue and
//! reports failure through `TransferFailed`.

use tracing::debug;

use crate::error::{ManagerError, ManagerResult};
use crate::tensor::DeviceTensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Device to host (offload a resident block).
    DeviceToHost,
    /// Host to device (load an evicted block).
    HostToDevice,
}

#[derive(Debug, Default)]
pub struct TransferStats {
    pub total_d2h_bytes: u64,
    pub total_h2d_bytes: u64,
    pub total_d2h_transfers: u64,
    pub total_h2d_transfers: u64,
}

/// Copy engine. Holds no state but accumulated stats; a real
/// implementation would own device handles and pinned staging buffers.
#[derive(Debug, Default)]
pub struct GpuTransferEngine {
    stats: TransferStats,
}

impl GpuTransferEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `src` from device to host, yielding control so the runtime can
    /// interleave other work while the (stubbed) copy is in flight.
    pub async fn copy_to_host(&mut self, src: &DeviceTensor) -> ManagerResult<DeviceTensor> {
        tokio::task::yield_now().await;
        debug!(elems = src.len(), "D2H transfer");
        self.stats.total_d2h_bytes += (src.len() * std::mem::size_of::<f32>()) as u64;
        self.stats.total_d2h_transfers += 1;
        Ok(src.clone())
    }

    /// Copy `src` from host to device.
    pub async fn copy_to_device(&mut self, src: &DeviceTensor) -> ManagerResult<DeviceTensor> {
        tokio::task::yield_now().await;
        debug!(elems = src.len(), "H2D transfer");
        self.stats.total_h2d_bytes += (src.len() * std::mem::size_of::<f32>()) as u64;
        self.stats.total_h2d_transfers += 1;
        Ok(src.clone())
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }
}

/// Helper matching the direction to the engine call, used by
/// `TransferHandle::new`.
pub async fn copy(
    engine: &mut GpuTransferEngine,
    direction: TransferDirection,
    src: &DeviceTensor,
) -> ManagerResult<DeviceTensor> {
    match direction {
        TransferDirection::DeviceToHost => engine.copy_to_host(src).await,
        TransferDirection::HostToDevice => engine.copy_to_device(src).await,
    }
    .map_err(|e| ManagerError::transfer(e.to_string()))
}

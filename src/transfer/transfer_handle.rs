//! One-shot asynchronous host↔device tensor move.
//!
//! Replaces a duck-typed attribute-proxying tensor with an explicit
//! two-state enum. Constructing a
//! handle immediately enqueues a non-blocking copy and hands back a
//! `tokio::sync::oneshot` completion token; the first access blocks on
//! that token and the handle transitions `Pending -> Ready` in place.
//! Once `Ready`, further accesses are free.

use tokio::sync::oneshot;

use crate::error::{ManagerError, ManagerResult};
use crate::tensor::DeviceTensor;
use crate::transfer::gpu_transfer::{copy, GpuTransferEngine, TransferDirection};

enum State {
    Pending(oneshot::Receiver<ManagerResult<DeviceTensor>>),
    Ready(DeviceTensor),
}

/// An in-flight or completed asynchronous tensor transfer.
pub struct TransferHandle {
    state: State,
}

impl TransferHandle {
    /// Enqueue a copy of `src` in `direction` on `engine`, returning a
    /// handle that is `Pending` until the copy completes.
    pub fn spawn(engine_handle: std::sync::Arc<tokio::sync::Mutex<GpuTransferEngine>>,
                 direction: TransferDirection,
                 src: DeviceTensor) -> Self {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut engine = engine_handle.lock().await;
            let result = copy(&mut engine, direction, &src).await;
            let _ = tx.send(result);
        });
        Self {
            state: State::Pending(rx),
        }
    }

    /// Build a handle that is already resolved — used for the degenerate
    /// case of constructing `BlockStore` entries before their first
    /// `load`/`offload`.
    pub fn ready(tensor: DeviceTensor) -> Self {
        Self {
            state: State::Ready(tensor),
        }
    }

    /// Block on the completion token if still pending, then return a
    /// reference to the resolved tensor. Idempotent.
    pub async fn resolve(&mut self) -> ManagerResult<&DeviceTensor> {
        if let State::Pending(rx) = &mut self.state {
            let result = match rx.await {
                Ok(r) => r,
                Err(_) => Err(ManagerError::transfer(
                    "transfer task dropped before completion".to_string(),
                )),
            };
            let tensor = result?;
            self.state = State::Ready(tensor);
        }
        match &self.state {
            State::Ready(t) => Ok(t),
            State::Pending(_) => unreachable!("resolved above"),
        }
    }

    /// True if the transfer has already completed and been observed.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, State::Ready(_))
    }
}

impl std::fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.state {
            State::Pending(_) => write!(f, "TransferHandle::Pending"),
            State::Ready(t) => write!(f, "TransferHandle::Ready({:?})", t.shape()),
        }
    }
}

//! Model execution backends. A backend owns every device allocation for one model and runs it
//! incrementally: bind input, step a bounded number of layers, then request an asynchronous
//! device-to-host copy of the output.
//!
//! Completion is delivered through a [`ReadbackCompletion`]: the backend fires it when the copy has
//! landed, and the owner drains the result on its next tick. Firing checks the owner's liveness
//! token first, so a completion that outlives its owner is a silent no-op.

mod cpu;
mod gpu;

use std::sync::mpsc::Sender;
use std::sync::{Arc, Weak};

pub use cpu::CpuBackend;
pub use gpu::GpuBackend;

use crate::error::Result;
use crate::frame::FrameTensor;
use crate::model::TensorShape;

/// Identifies one inference cycle; stale completions carry an older id.
pub type CycleId = u64;

/// Result of one readback, posted to the owning scheduler.
#[derive(Debug)]
pub struct ReadbackMessage {
    pub cycle: CycleId,
    pub result: Result<Vec<f32>>,
}

/// Continuation for one outstanding device-to-host copy.
#[derive(Debug)]
pub struct ReadbackCompletion {
    cycle: CycleId,
    liveness: Weak<()>,
    sender: Sender<ReadbackMessage>,
}

impl ReadbackCompletion {
    /// `liveness` is the owner's token; the completion only keeps a weak handle to it.
    pub fn new(cycle: CycleId, liveness: &Arc<()>, sender: Sender<ReadbackMessage>) -> Self {
        Self { cycle, liveness: Arc::downgrade(liveness), sender }
    }

    pub fn cycle(&self) -> CycleId {
        self.cycle
    }

    /// False once the owner has been torn down.
    pub fn is_live(&self) -> bool {
        self.liveness.strong_count() > 0
    }

    /// Deliver the copied output. Returns false, touching nothing, if the owner is gone.
    pub fn complete(self, result: Result<Vec<f32>>) -> bool {
        let Some(_owner) = self.liveness.upgrade() else {
            return false;
        };
        self.sender.send(ReadbackMessage { cycle: self.cycle, result }).is_ok()
    }
}

/// Incremental model executor.
pub trait ModelBackend: Send {
    fn name(&self) -> &'static str;

    fn input_shape(&self) -> TensorShape;

    /// Units of work (layers) in one forward pass.
    fn total_units(&self) -> usize;

    /// Upload `input` and rewind to the first unit.
    fn bind_input(&mut self, input: &FrameTensor) -> Result<()>;

    /// Run at most `budget` units. Returns how many ran; 0 once the pass is complete.
    fn step(&mut self, budget: usize) -> Result<usize>;

    /// Start the non-blocking copy of the final output. Only valid after every unit ran.
    fn request_readback(&mut self, completion: ReadbackCompletion) -> Result<()>;

    /// Drive outstanding device work and fire completions whose copy finished. Never blocks.
    fn poll_device(&mut self) -> Result<()>;

    /// Release every device allocation. Idempotent; a pending completion is dropped unfired.
    fn dispose(&mut self);
}

impl<B: ModelBackend + ?Sized> ModelBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }
    fn input_shape(&self) -> TensorShape {
        (**self).input_shape()
    }
    fn total_units(&self) -> usize {
        (**self).total_units()
    }
    fn bind_input(&mut self, input: &FrameTensor) -> Result<()> {
        (**self).bind_input(input)
    }
    fn step(&mut self, budget: usize) -> Result<usize> {
        (**self).step(budget)
    }
    fn request_readback(&mut self, completion: ReadbackCompletion) -> Result<()> {
        (**self).request_readback(completion)
    }
    fn poll_device(&mut self) -> Result<()> {
        (**self).poll_device()
    }
    fn dispose(&mut self) {
        (**self).dispose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn completion_after_owner_drop_is_noop() {
        let (tx, rx) = mpsc::channel();
        let owner = Arc::new(());
        let completion = ReadbackCompletion::new(3, &owner, tx);
        assert!(completion.is_live());
        drop(owner);
        assert!(!completion.is_live());
        assert!(!completion.complete(Ok(vec![1.0; 27])));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn completion_posts_cycle_and_payload() {
        let (tx, rx) = mpsc::channel();
        let owner = Arc::new(());
        assert!(ReadbackCompletion::new(7, &owner, tx).complete(Ok(vec![2.0])));
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.cycle, 7);
        assert_eq!(msg.result.unwrap(), vec![2.0]);
    }
}

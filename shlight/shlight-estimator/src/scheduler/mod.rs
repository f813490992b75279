//! Time-sliced inference: a forward pass is spread over several ticks, at most `quota` layers
//! per call, followed by a non-blocking readback.
//!
//! The readback result arrives through a channel drained by [`InferenceScheduler::poll_readback`].
//! Completions carry the cycle id they were issued for and a weak handle to the scheduler's
//! liveness token, so a completion fired after teardown does nothing.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;

use log::{debug, trace};

use crate::backend::{CycleId, ModelBackend, ReadbackCompletion, ReadbackMessage};
use crate::error::{EstimatorError, Result};
use crate::frame::FrameTensor;
use crate::sh::{OutputLayout, ShBuffer};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    AwaitingReadback,
    TornDown,
}

pub struct InferenceScheduler<B: ModelBackend> {
    backend: B,
    layout: OutputLayout,
    phase: Phase,
    cycle: CycleId,
    units_done: usize,
    liveness: Option<Arc<()>>,
    sender: Sender<ReadbackMessage>,
    receiver: Receiver<ReadbackMessage>,
}

impl<B: ModelBackend> InferenceScheduler<B> {
    pub fn new(backend: B, layout: OutputLayout) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            backend,
            layout,
            phase: Phase::Idle,
            cycle: 0,
            units_done: 0,
            liveness: Some(Arc::new(())),
            sender,
            receiver,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn layout(&self) -> OutputLayout {
        self.layout
    }

    /// Takes effect for the next readback.
    pub fn set_layout(&mut self, layout: OutputLayout) {
        self.layout = layout;
    }

    /// True between `begin_cycle` and the delivery of its readback.
    pub fn is_busy(&self) -> bool {
        matches!(self.phase, Phase::Running | Phase::AwaitingReadback)
    }

    pub fn is_torn_down(&self) -> bool {
        self.phase == Phase::TornDown
    }

    pub fn current_cycle(&self) -> CycleId {
        self.cycle
    }

    pub fn units_done(&self) -> usize {
        self.units_done
    }

    pub fn total_units(&self) -> usize {
        self.backend.total_units()
    }

    /// Bind `input` and start a new cycle. Fails with `Busy` and changes nothing while a cycle
    /// is in flight.
    pub fn begin_cycle(&mut self, input: &FrameTensor) -> Result<()> {
        match self.phase {
            Phase::TornDown => return Err(EstimatorError::TornDown),
            Phase::Running | Phase::AwaitingReadback => return Err(EstimatorError::Busy),
            Phase::Idle => {}
        }
        self.backend.bind_input(input)?;
        self.cycle += 1;
        self.units_done = 0;
        self.phase = Phase::Running;
        debug!("cycle {} started on {} backend", self.cycle, self.backend.name());
        Ok(())
    }

    /// Run up to `quota` units (0 is treated as 1). Returns true while units remain; on the
    /// call that finishes the pass the readback is requested and false is returned.
    pub fn advance(&mut self, quota: usize) -> Result<bool> {
        match self.phase {
            Phase::TornDown => return Err(EstimatorError::TornDown),
            Phase::Running => {}
            Phase::Idle | Phase::AwaitingReadback => return Ok(false),
        }
        let ran = self.backend.step(quota.max(1))?;
        self.units_done += ran;
        let total = self.backend.total_units();
        trace!("cycle {}: {}/{} units", self.cycle, self.units_done, total);
        if self.units_done < total {
            return Ok(true);
        }
        let completion = self.completion()?;
        self.backend.request_readback(completion)?;
        self.phase = Phase::AwaitingReadback;
        Ok(false)
    }

    /// The raw output of the current cycle, exactly once. None while the transfer is still in
    /// flight or when no readback is outstanding.
    pub fn poll_readback(&mut self) -> Result<Option<ShBuffer>> {
        match self.phase {
            Phase::TornDown => return Err(EstimatorError::TornDown),
            Phase::AwaitingReadback => {}
            Phase::Idle | Phase::Running => return Ok(None),
        }
        self.backend.poll_device()?;
        loop {
            let message = match self.receiver.try_recv() {
                Ok(message) => message,
                Err(TryRecvError::Empty) => return Ok(None),
                // The scheduler holds a sender, so the channel never disconnects.
                Err(TryRecvError::Disconnected) => return Ok(None),
            };
            if message.cycle != self.cycle {
                debug!(
                    "discarding stale readback for cycle {} (current {})",
                    message.cycle, self.cycle
                );
                continue;
            }
            self.phase = Phase::Idle;
            let values = message.result?;
            return ShBuffer::from_flat(&values, self.layout).map(Some);
        }
    }

    /// Abandon any cycle in flight and dispose the backend. Idempotent.
    pub fn teardown(&mut self) {
        if self.phase == Phase::TornDown {
            return;
        }
        if self.is_busy() {
            debug!("tearing down with cycle {} in flight", self.cycle);
        }
        self.liveness = None;
        self.backend.dispose();
        while self.receiver.try_recv().is_ok() {}
        self.phase = Phase::TornDown;
    }

    fn completion(&self) -> Result<ReadbackCompletion> {
        let liveness = self.liveness.as_ref().ok_or(EstimatorError::TornDown)?;
        Ok(ReadbackCompletion::new(self.cycle, liveness, self.sender.clone()))
    }
}

impl<B: ModelBackend> Drop for InferenceScheduler<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::model::Model;

    fn scheduler(latency: u32) -> InferenceScheduler<CpuBackend> {
        let backend = CpuBackend::new(Model::quadrant_projector(4, 4).unwrap())
            .with_readback_latency(latency);
        InferenceScheduler::new(backend, OutputLayout::Interleaved)
    }

    fn gray() -> FrameTensor {
        FrameTensor::from_chw(4, 4, vec![0.5; 48]).unwrap()
    }

    #[test]
    fn busy_scheduler_rejects_second_cycle() {
        let mut s = scheduler(0);
        s.begin_cycle(&gray()).unwrap();
        assert!(matches!(s.begin_cycle(&gray()), Err(EstimatorError::Busy)));
        assert_eq!(s.current_cycle(), 1);
        assert_eq!(s.units_done(), 0);
    }

    #[test]
    fn zero_quota_still_progresses() {
        let mut s = scheduler(0);
        s.begin_cycle(&gray()).unwrap();
        assert!(s.advance(0).unwrap());
        assert_eq!(s.units_done(), 1);
        assert!(!s.advance(0).unwrap());
        assert!(s.is_busy());
    }

    #[test]
    fn readback_is_delivered_exactly_once() {
        let mut s = scheduler(1);
        s.begin_cycle(&gray()).unwrap();
        assert!(!s.advance(10).unwrap());
        assert!(s.poll_readback().unwrap().is_none());
        let sh = s.poll_readback().unwrap().unwrap();
        assert!(sh.is_finite());
        assert!(!s.is_busy());
        assert!(s.poll_readback().unwrap().is_none());
    }

    #[test]
    fn stale_cycle_messages_are_discarded() {
        let mut s = scheduler(3);
        s.begin_cycle(&gray()).unwrap();
        s.advance(10).unwrap();
        s.sender.send(ReadbackMessage { cycle: 0, result: Ok(vec![9.0; 27]) }).unwrap();
        assert!(s.poll_readback().unwrap().is_none());
        assert!(s.is_busy());
    }

    #[test]
    fn teardown_is_idempotent_and_final() {
        let mut s = scheduler(0);
        s.begin_cycle(&gray()).unwrap();
        s.teardown();
        s.teardown();
        assert!(s.is_torn_down());
        assert!(matches!(s.begin_cycle(&gray()), Err(EstimatorError::TornDown)));
    }
}

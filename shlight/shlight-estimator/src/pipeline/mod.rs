//! Per-tick state machine tying the stages together:
//! Idle -> Scheduling -> ReadbackPending -> Idle, one cycle in flight at a time.

use std::time::{Duration, Instant};

use light_api::{CameraSource, LightingSink};
use log::{debug, error, info, trace, warn};

use crate::applier::{DominantLight, LightingApplier};
use crate::backend::ModelBackend;
use crate::config::EstimatorConfig;
use crate::error::{EstimatorError, Result};
use crate::filter::TemporalShFilter;
use crate::frame::FramePreprocessor;
use crate::model::TensorShape;
use crate::scheduler::InferenceScheduler;
use crate::sh::ShBuffer;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PipelineState {
    #[default]
    Idle,
    Scheduling,
    ReadbackPending,
}

/// What one `tick` did.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TickOutcome {
    /// The controller hit a fatal error earlier and no longer runs.
    Disabled,
    /// Idle and the camera had nothing new (or the frame was skipped).
    NoFrame,
    /// A cycle was started on a fresh frame.
    Started,
    Advanced { completed: usize, total: usize },
    /// The output transfer has not landed yet.
    AwaitingReadback,
    /// A sample went through the filter and the ambient probe was installed. Carries the
    /// directional light when one was derived.
    Applied(Option<DominantLight>),
    /// The model produced non-finite values; the sample was dropped.
    Discarded,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CycleStats {
    pub cycles_completed: u64,
    /// Frames dropped by the preprocessor.
    pub frames_skipped: u64,
    /// Samples dropped for non-finite values.
    pub outputs_discarded: u64,
    /// Ticks from start to apply of the last completed cycle.
    pub last_cycle_ticks: u32,
    pub last_cycle_duration: Option<Duration>,
}

pub struct PipelineController<B: ModelBackend, S: LightingSink> {
    config: EstimatorConfig,
    preprocessor: FramePreprocessor,
    scheduler: InferenceScheduler<B>,
    filter: TemporalShFilter,
    applier: LightingApplier<S>,
    state: PipelineState,
    disabled: bool,
    stats: CycleStats,
    cycle_ticks: u32,
    cycle_started: Option<Instant>,
    last_sample: Option<ShBuffer>,
}

impl<B: ModelBackend, S: LightingSink> PipelineController<B, S> {
    /// Validate `config` against `backend` and assemble the stages. Any mismatch is a
    /// misconfiguration and nothing is started.
    pub fn new(
        config: EstimatorConfig,
        camera: Box<dyn CameraSource>,
        backend: B,
        sink: S,
    ) -> Result<Self> {
        config.validate()?;
        let expected =
            TensorShape::new(3, config.target_height as usize, config.target_width as usize);
        if backend.input_shape() != expected {
            return Err(EstimatorError::Misconfiguration(format!(
                "model input {:?} does not match target resolution {}x{}",
                backend.input_shape(),
                config.target_width,
                config.target_height
            )));
        }
        info!(
            "pipeline: {} backend, {} units per pass, {} per tick, history {}, filter {:?}",
            backend.name(),
            backend.total_units(),
            config.quota(),
            config.history_size,
            config.filter
        );
        Ok(Self {
            preprocessor: FramePreprocessor::new(camera, &config),
            scheduler: InferenceScheduler::new(backend, config.output_layout),
            filter: TemporalShFilter::from_config(&config)?,
            applier: LightingApplier::new(sink, &config),
            config,
            state: PipelineState::Idle,
            disabled: false,
            stats: CycleStats::default(),
            cycle_ticks: 0,
            cycle_started: None,
            last_sample: None,
        })
    }

    /// Advance by one render tick. Never blocks. A backend failure disables the controller.
    pub fn tick(&mut self) -> TickOutcome {
        if self.disabled {
            return TickOutcome::Disabled;
        }
        match self.step() {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("light estimation disabled: {e}");
                self.disable();
                TickOutcome::Disabled
            }
        }
    }

    fn step(&mut self) -> Result<TickOutcome> {
        match self.state {
            PipelineState::Idle => {
                let Some(tensor) = self.preprocessor.try_acquire_frame() else {
                    return Ok(TickOutcome::NoFrame);
                };
                self.scheduler.begin_cycle(tensor)?;
                self.state = PipelineState::Scheduling;
                self.cycle_ticks = 1;
                self.cycle_started = Some(Instant::now());
                Ok(TickOutcome::Started)
            }
            PipelineState::Scheduling => {
                self.cycle_ticks += 1;
                let working = self.scheduler.advance(self.config.quota())?;
                if !working {
                    self.state = PipelineState::ReadbackPending;
                }
                Ok(TickOutcome::Advanced {
                    completed: self.scheduler.units_done(),
                    total: self.scheduler.total_units(),
                })
            }
            PipelineState::ReadbackPending => {
                self.cycle_ticks += 1;
                let Some(raw) = self.scheduler.poll_readback()? else {
                    trace!("readback pending");
                    return Ok(TickOutcome::AwaitingReadback);
                };
                self.state = PipelineState::Idle;
                self.finish_cycle();
                if !raw.is_finite() {
                    warn!("model output contains non-finite values; sample dropped");
                    self.stats.outputs_discarded += 1;
                    return Ok(TickOutcome::Discarded);
                }
                self.last_sample = Some(raw);
                let filtered = self.filter.push(raw);
                Ok(TickOutcome::Applied(self.applier.apply(&filtered)))
            }
        }
    }

    fn finish_cycle(&mut self) {
        let elapsed = self.cycle_started.take().map(|t| t.elapsed());
        self.stats.cycles_completed += 1;
        self.stats.last_cycle_ticks = self.cycle_ticks;
        self.stats.last_cycle_duration = elapsed;
        debug!(
            "cycle {} done in {} ticks ({:?})",
            self.scheduler.current_cycle(),
            self.cycle_ticks,
            elapsed.unwrap_or_default()
        );
    }

    fn disable(&mut self) {
        self.disabled = true;
        self.state = PipelineState::Idle;
        self.scheduler.teardown();
    }

    /// Apply runtime-tunable settings. The target resolution is fixed by the model and cannot
    /// change; on error nothing is applied.
    pub fn apply_tuning(&mut self, tuning: &EstimatorConfig) -> Result<()> {
        tuning.validate()?;
        let fixed = (self.config.target_width, self.config.target_height);
        if (tuning.target_width, tuning.target_height) != fixed {
            return Err(EstimatorError::Misconfiguration(format!(
                "target resolution is fixed at {}x{}, got {}x{}",
                fixed.0, fixed.1, tuning.target_width, tuning.target_height
            )));
        }
        if tuning.history_size != self.filter.capacity() {
            self.filter.resize(tuning.history_size)?;
        }
        if tuning.filter != self.filter.mode() {
            self.filter.set_mode(tuning.filter);
        }
        self.filter.set_seed(tuning.seed_value);
        self.applier.configure(tuning);
        self.preprocessor.configure(tuning);
        self.scheduler.set_layout(tuning.output_layout);
        debug!("tuning applied: {tuning:?}");
        self.config = tuning.clone();
        Ok(())
    }

    /// Abandon any cycle in flight and release the backend. The controller stays disabled.
    pub fn teardown(&mut self) {
        if !self.disabled {
            debug!("pipeline teardown in state {:?}", self.state);
        }
        self.disable();
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn stats(&self) -> CycleStats {
        CycleStats { frames_skipped: self.preprocessor.frames_skipped(), ..self.stats }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn filter(&self) -> &TemporalShFilter {
        &self.filter
    }

    /// Raw model output of the last completed cycle.
    pub fn last_sample(&self) -> Option<ShBuffer> {
        self.last_sample
    }

    pub fn sink(&self) -> &S {
        self.applier.sink()
    }

    pub fn scheduler(&self) -> &InferenceScheduler<B> {
        &self.scheduler
    }
}

impl<B: ModelBackend, S: LightingSink> Drop for PipelineController<B, S> {
    fn drop(&mut self) {
        self.scheduler.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::model::Model;
    use light_api::{ExtractedLighting, RawImage};

    struct Repeating(RawImage);

    impl CameraSource for Repeating {
        fn try_acquire_latest_frame(&mut self) -> Option<RawImage> {
            Some(self.0.clone())
        }
    }

    fn config() -> EstimatorConfig {
        EstimatorConfig {
            target_width: 8,
            target_height: 8,
            layers_per_tick: 1,
            ..Default::default()
        }
    }

    fn controller(config: EstimatorConfig) -> PipelineController<CpuBackend, ExtractedLighting> {
        let backend = CpuBackend::new(Model::quadrant_projector(8, 8).unwrap());
        let camera = Box::new(Repeating(RawImage::solid_rgba(16, 16, [255, 255, 255, 255])));
        PipelineController::new(config, camera, backend, ExtractedLighting::new()).unwrap()
    }

    #[test]
    fn walks_through_every_state() {
        let mut c = controller(config());
        assert_eq!(c.tick(), TickOutcome::Started);
        assert_eq!(c.state(), PipelineState::Scheduling);
        assert_eq!(c.tick(), TickOutcome::Advanced { completed: 1, total: 2 });
        assert_eq!(c.tick(), TickOutcome::Advanced { completed: 2, total: 2 });
        assert_eq!(c.state(), PipelineState::ReadbackPending);
        assert!(matches!(c.tick(), TickOutcome::Applied(_)));
        assert_eq!(c.state(), PipelineState::Idle);
        let stats = c.stats();
        assert_eq!(stats.cycles_completed, 1);
        assert_eq!(stats.last_cycle_ticks, 4);
        assert!(c.sink().ambient.is_some());
    }

    #[test]
    fn mismatched_model_is_misconfiguration() {
        let backend = CpuBackend::new(Model::quadrant_projector(4, 4).unwrap());
        let camera = Box::new(Repeating(RawImage::solid_rgba(4, 4, [0, 0, 0, 255])));
        let err =
            PipelineController::new(config(), camera, backend, ExtractedLighting::new()).err();
        assert!(matches!(err, Some(EstimatorError::Misconfiguration(_))));
    }

    #[test]
    fn resolution_cannot_be_retuned() {
        let mut c = controller(config());
        let mut tuning = config();
        tuning.target_width = 16;
        assert!(c.apply_tuning(&tuning).is_err());

        let mut tuning = config();
        tuning.history_size = 3;
        tuning.layers_per_tick = 0;
        c.apply_tuning(&tuning).unwrap();
        assert_eq!(c.filter().len(), 3);
        assert_eq!(c.config().quota(), 1);
    }

    #[test]
    fn teardown_disables() {
        let mut c = controller(config());
        c.tick();
        c.teardown();
        assert_eq!(c.tick(), TickOutcome::Disabled);
        assert!(c.scheduler().is_torn_down());
    }
}

//! Cooperative layer stepper.
//!
//! A [`Session`] runs one model on one backend. Each run is a [`Schedule`]:
//! an explicit state machine that executes one layer per
//! [`Schedule::next_step`] call and hands control back to the host in
//! between, so a host can report progress, pace frames or simply stop.
//!
//! ```
//! use cairn_core::{Layer, ModelBuilder, Tensor};
//! use cairn_runtime::{CpuBackend, RuntimeConfig, Session, StepResult};
//!
//! let model = ModelBuilder::new()
//!     .input("x", [3])
//!     .layer(Layer::new("y", "Neg").with_inputs(["x"]))
//!     .layer(Layer::new("z", "Relu").with_inputs(["y"]))
//!     .build()?;
//! let mut session = Session::new(model, CpuBackend::new(), RuntimeConfig::default())?;
//!
//! let x = Tensor::from_vec(vec![-1.0f32, 0.0, 2.0], [3])?;
//! let mut schedule = session.start_manual_schedule(&[("x", x)])?;
//! while let StepResult::Continue(step) = schedule.next_step()? {
//!     println!("ran {} ({:.0}%)", step.layer, schedule.progress() * 100.0);
//! }
//!
//! let z = session.peek_output("z")?;
//! assert_eq!(z.to_vec::<f32>()?, vec![1.0, 0.0, 0.0]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::backend::Backend;
use crate::config::RuntimeConfig;
use crate::cpu::CpuBackend;
use crate::error::{Result, RuntimeError};
use crate::footprint::{FootprintAnalysis, StorageAnalysis};
use crate::liveness::LivenessPlan;
use crate::store::{StoreStats, TeardownReport, VariableStore};
use cairn_core::{BufferFactory, Model, Shape, Tensor};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Shared, thread-safe view of a schedule's progress.
#[derive(Debug, Clone, Default)]
pub struct ScheduleProgress {
    inner: Arc<ProgressCounters>,
}

#[derive(Debug, Default)]
struct ProgressCounters {
    completed: AtomicUsize,
    total: AtomicUsize,
}

impl ScheduleProgress {
    fn start(&self, total: usize) {
        self.inner.completed.store(0, Ordering::Release);
        self.inner.total.store(total, Ordering::Release);
    }

    fn advance(&self) {
        self.inner.completed.fetch_add(1, Ordering::AcqRel);
    }

    /// Layers completed in the current run.
    pub fn completed(&self) -> usize {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Layers in the current run.
    pub fn total(&self) -> usize {
        self.inner.total.load(Ordering::Acquire)
    }

    /// `completed / total` in `[0, 1]`; zero before the first run.
    pub fn fraction(&self) -> f32 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.completed() as f32 / total as f32
    }
}

/// Where a schedule stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    NotStarted,
    /// Layers before this index have run.
    Stepping(usize),
    /// Finished, failed or cancelled. Terminal.
    Done,
}

/// One completed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub index: usize,
    pub layer: String,
    /// Name of the backend that ran the layer.
    pub backend: String,
}

/// Result of [`Schedule::next_step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Continue(StepReport),
    Done,
}

/// Executes a model layer by layer.
pub struct Session {
    model: Arc<Model>,
    backend: Arc<dyn Backend>,
    fallback: Arc<dyn Backend>,
    /// Per layer: run on the fallback backend.
    fallback_layers: Vec<bool>,
    analysis: Box<dyn StorageAnalysis>,
    config: RuntimeConfig,
    store: VariableStore,
    shapes: Arc<HashMap<String, Shape>>,
    takeover: bool,
    progress: ScheduleProgress,
}

fn flag_fallback_layers(
    model: &Model,
    backend: &dyn Backend,
    fallback: &dyn Backend,
) -> Result<Vec<bool>> {
    model
        .layers()
        .iter()
        .map(|layer| {
            if backend.supports(&layer.op_type) {
                Ok(false)
            } else if fallback.supports(&layer.op_type) {
                tracing::debug!(
                    layer = %layer.name,
                    op_type = %layer.op_type,
                    fallback = fallback.name(),
                    "layer flagged for fallback"
                );
                Ok(true)
            } else {
                Err(RuntimeError::UnsupportedOp {
                    layer: layer.name.clone(),
                    op_type: layer.op_type.clone(),
                })
            }
        })
        .collect()
}

fn buffer_factories(backend: &dyn Backend, fallback: &dyn Backend) -> Vec<Arc<dyn BufferFactory>> {
    let mut factories = vec![backend.buffer_factory()];
    if fallback.device() != backend.device() {
        factories.push(fallback.buffer_factory());
    }
    factories
}

impl Session {
    /// Create a session running `model` on `backend`.
    ///
    /// Layers `backend` does not support are flagged for the CPU fallback.
    ///
    /// # Errors
    /// `UnsupportedOp` if neither backend supports some layer.
    pub fn new(
        model: impl Into<Arc<Model>>,
        backend: impl Backend + 'static,
        config: RuntimeConfig,
    ) -> Result<Self> {
        let model = model.into();
        let backend: Arc<dyn Backend> = Arc::new(backend);
        let fallback: Arc<dyn Backend> = Arc::new(CpuBackend::new());
        let fallback_layers = flag_fallback_layers(&model, backend.as_ref(), fallback.as_ref())?;
        let store = VariableStore::new(
            &config,
            buffer_factories(backend.as_ref(), fallback.as_ref()),
        );

        tracing::debug!(
            layers = model.len(),
            backend = backend.name(),
            policy = %config.policy,
            cache = %config.cache,
            "session created"
        );

        Ok(Self {
            model,
            backend,
            fallback,
            fallback_layers,
            analysis: Box::new(FootprintAnalysis),
            config,
            store,
            shapes: Arc::new(HashMap::new()),
            takeover: false,
            progress: ScheduleProgress::default(),
        })
    }

    /// Replace the fallback backend.
    ///
    /// # Errors
    /// `UnsupportedOp` if neither backend supports some layer.
    pub fn with_fallback(mut self, fallback: impl Backend + 'static) -> Result<Self> {
        let fallback: Arc<dyn Backend> = Arc::new(fallback);
        self.fallback_layers =
            flag_fallback_layers(&self.model, self.backend.as_ref(), fallback.as_ref())?;
        self.store = VariableStore::new(
            &self.config,
            buffer_factories(self.backend.as_ref(), fallback.as_ref()),
        );
        self.fallback = fallback;
        Ok(self)
    }

    /// Replace the requires-storage analysis.
    pub fn with_storage_analysis(mut self, analysis: impl StorageAnalysis + 'static) -> Self {
        self.analysis = Box::new(analysis);
        // New allocation so the store rebuilds its plan.
        self.shapes = Arc::new(self.shapes.as_ref().clone());
        self
    }

    /// Let the persistent allocator adopt unowned input buffers.
    pub fn with_input_takeover(mut self, takeover: bool) -> Self {
        self.takeover = takeover;
        self
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Names of layers that run on the fallback backend.
    pub fn fallback_layers(&self) -> Vec<&str> {
        self.model
            .layers()
            .iter()
            .zip(&self.fallback_layers)
            .filter(|(_, fallback)| **fallback)
            .map(|(layer, _)| layer.name.as_str())
            .collect()
    }

    fn backend_for(&self, index: usize) -> &Arc<dyn Backend> {
        if self.fallback_layers.get(index).copied().unwrap_or(false) {
            &self.fallback
        } else {
            &self.backend
        }
    }

    fn prepare(&mut self) -> Result<()> {
        self.store.prepare_storage(
            &self.model,
            &self.shapes,
            self.analysis.as_ref(),
            self.takeover,
        )
    }

    /// Declare input shapes ahead of binding tensors and prepare storage.
    ///
    /// # Errors
    /// `UnknownInput` for names the model does not declare, or any
    /// preparation error.
    pub fn prepare_for_input(&mut self, shapes: HashMap<String, Shape>) -> Result<()> {
        if let Some(unknown) = shapes.keys().find(|name| self.model.input(name).is_none()) {
            return Err(RuntimeError::UnknownInput(unknown.clone()));
        }
        if *self.shapes != shapes {
            self.shapes = Arc::new(shapes);
        }
        self.prepare()
    }

    /// Bind a model input. Prepares storage when the model has one input.
    ///
    /// # Errors
    /// `UnknownInput` if the model declares no such input.
    pub fn set_input(&mut self, name: &str, tensor: Tensor) -> Result<()> {
        if self.model.input(name).is_none() {
            return Err(RuntimeError::UnknownInput(name.to_string()));
        }
        self.store.set_input(name, tensor)?;
        if self.model.inputs().len() == 1 {
            self.prepare()?;
        }
        Ok(())
    }

    /// Bind the model's only input.
    ///
    /// # Errors
    /// `AmbiguousInput` unless the model declares exactly one input.
    pub fn set_default_input(&mut self, tensor: Tensor) -> Result<()> {
        let name = match self.model.inputs() {
            [input] => input.name.clone(),
            inputs => return Err(RuntimeError::AmbiguousInput(inputs.len())),
        };
        self.set_input(&name, tensor)
    }

    /// Bind `inputs`, prepare storage and return a fresh schedule.
    ///
    /// The schedule is not restartable; each call starts a new run, which
    /// releases the previous run's outputs.
    #[tracing::instrument(skip_all, fields(layers = self.model.len(), inputs = inputs.len()))]
    pub fn start_manual_schedule(&mut self, inputs: &[(&str, Tensor)]) -> Result<Schedule<'_>> {
        for (name, tensor) in inputs {
            self.set_input(name, tensor.clone())?;
        }
        self.prepare()?;
        self.store.begin_run()?;
        self.progress.start(self.model.len());
        Ok(Schedule {
            session: self,
            next: 0,
            state: ScheduleState::NotStarted,
        })
    }

    /// Run every layer.
    ///
    /// # Errors
    /// Preparation errors, or `Execution` naming the layer that failed.
    pub fn execute(&mut self, inputs: &[(&str, Tensor)]) -> Result<&mut Self> {
        let steps = self.start_manual_schedule(inputs)?.run_to_end()?;
        tracing::debug!(steps, "execution finished");
        Ok(self)
    }

    /// Fraction of layers completed in the current or last run.
    pub fn schedule_progress(&self) -> f32 {
        self.progress.fraction()
    }

    /// Progress handle that stays readable while a schedule borrows the session.
    pub fn progress_handle(&self) -> ScheduleProgress {
        self.progress.clone()
    }

    /// Wait for device work behind the most recently produced tensor.
    pub fn flush_schedule(&self, blocking: bool) -> Result<()> {
        match self.store.last_output() {
            Some((index, tensor)) => self.backend_for(index).flush(tensor, blocking),
            None => Ok(()),
        }
    }

    /// Tensor currently bound to `name`.
    ///
    /// # Errors
    /// `TensorNotFound` if nothing is bound under `name`.
    pub fn peek_output(&self, name: &str) -> Result<Tensor> {
        self.store.peek(name)
    }

    /// The first model output.
    pub fn output(&self) -> Result<Tensor> {
        let name = self
            .model
            .outputs()
            .first()
            .ok_or_else(|| RuntimeError::TensorNotFound("<model output>".to_string()))?;
        self.store.peek(name)
    }

    /// Take ownership of a produced tensor; it survives later runs and teardown.
    pub fn take_output(&mut self, name: &str) -> Result<Tensor> {
        self.store.take(name)
    }

    pub fn liveness_plan(&self) -> Option<&LivenessPlan> {
        self.store.liveness_plan()
    }

    pub fn store(&self) -> &VariableStore {
        &self.store
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Whether a run has started and not finished.
    pub fn is_occupied(&self) -> bool {
        self.store.is_occupied()
    }

    /// Release every binding and all cached memory.
    pub fn dispose(&mut self) -> TeardownReport {
        self.store.teardown()
    }

    fn run_layer(&mut self, index: usize) -> Result<StepReport> {
        let model = Arc::clone(&self.model);
        let layer = &model.layers()[index];
        let backend = Arc::clone(self.backend_for(index));
        let _span =
            tracing::debug_span!("step", index, layer = %layer.name, backend = backend.name())
                .entered();

        let inputs = self.store.gather_inputs(layer)?;
        let mut ctx = self.store.context(index, backend.device());
        let result = backend.execute(layer, &inputs, &mut ctx);
        let (scratch, allocated) = ctx.into_allocations();
        let escaped = match &result {
            Ok(output) => {
                scratch.iter().any(|tensor| tensor.id() == output.id())
                    || self.store.is_ephemeral(output)
            }
            Err(_) => false,
        };
        self.store.release_scratch(scratch);
        let returned = result.as_ref().ok().map(Tensor::id);
        self.store.release_unreturned(
            allocated
                .into_iter()
                .filter(|tensor| Some(tensor.id()) != returned),
        );
        let output = result?;
        if escaped {
            return Err(RuntimeError::EphemeralEscape(layer.name.clone()));
        }

        self.store.store(index, &layer.name, output)?;
        let disposed = self.store.dispose_after_layer(index);
        tracing::debug!(disposed, "layer complete");

        Ok(StepReport {
            index,
            layer: layer.name.clone(),
            backend: backend.name().to_string(),
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("layers", &self.model.len())
            .field("backend", &self.backend.name())
            .field("fallback", &self.fallback.name())
            .field("config", &self.config)
            .finish()
    }
}

/// One run of a [`Session`], advanced explicitly by the host.
///
/// Dropping an unfinished schedule cancels the run. Its bindings are
/// released by the next run or by [`Session::dispose`].
#[derive(Debug)]
pub struct Schedule<'a> {
    session: &'a mut Session,
    next: usize,
    state: ScheduleState,
}

impl Schedule<'_> {
    /// Execute the next layer.
    ///
    /// Returns [`StepResult::Done`] once every layer has run, and on every
    /// call after that.
    ///
    /// # Errors
    /// `Execution` naming the failed layer. The schedule is then finished.
    pub fn next_step(&mut self) -> Result<StepResult> {
        if self.state == ScheduleState::Done {
            return Ok(StepResult::Done);
        }

        let index = self.next;
        match self.session.run_layer(index) {
            Ok(report) => {
                self.next += 1;
                self.session.progress.advance();
                if self.next == self.session.model.len() {
                    self.session.store.end_run();
                    self.state = ScheduleState::Done;
                    tracing::debug!(layers = self.next, "schedule complete");
                } else {
                    self.state = ScheduleState::Stepping(self.next);
                }
                Ok(StepResult::Continue(report))
            }
            Err(err) => {
                self.state = ScheduleState::Done;
                let layer = self.session.model.layers()[index].name.clone();
                tracing::warn!(%layer, index, error = %err, "layer failed, schedule abandoned");
                Err(RuntimeError::Execution {
                    layer,
                    source: Box::new(err),
                })
            }
        }
    }

    /// Drain the remaining steps. Returns how many layers ran.
    pub fn run_to_end(&mut self) -> Result<usize> {
        let mut steps = 0;
        while let StepResult::Continue(_) = self.next_step()? {
            steps += 1;
        }
        Ok(steps)
    }

    pub fn state(&self) -> ScheduleState {
        self.state
    }

    pub fn progress(&self) -> f32 {
        self.session.progress.fraction()
    }

    /// Synchronize with device work of the latest step.
    pub fn flush(&self, blocking: bool) -> Result<()> {
        self.session.flush_schedule(blocking)
    }

    /// Read a currently bound tensor mid-run.
    pub fn peek(&self, name: &str) -> Result<Tensor> {
        self.session.peek_output(name)
    }
}

impl Iterator for Schedule<'_> {
    type Item = Result<StepReport>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_step() {
            Ok(StepResult::Continue(report)) => Some(Ok(report)),
            Ok(StepResult::Done) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

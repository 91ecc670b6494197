//! Session orchestrator: Load → Rewrite → Plan → Run.

mod options;
mod state_init;

pub use options::{RunOptions, SessionOptions};
pub(crate) use state_init::build_session_state;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::error::EngineError;
use crate::exec::{
    CpuExecutionProvider, ExecutionFrame, ExecutionProvider, ExecutionProviders, ParallelExecutor,
    SequentialExecutor, SessionState,
};
use crate::graph::ValueInfo;
use crate::logging;
use crate::model::Model;
use crate::profile::Profiler;
use crate::rewrite::{GraphTransformer, TransformerManager};
use crate::tensor::{MlValue, CPU_PROVIDER};

pub struct Session {
    options: SessionOptions,
    transformers: TransformerManager,
    providers: ExecutionProviders,
    pool: Option<Arc<rayon::ThreadPool>>,
    profiler: Profiler,
    model: Option<Model>,
    state: Option<Arc<SessionState>>,

    // Model metadata captured at load for fast validation.
    required_input_names: HashSet<String>,
    model_input_names: HashSet<String>,
    model_output_names: Vec<String>,

    current_num_runs: AtomicUsize,
}

impl Session {
    pub fn new(options: SessionOptions) -> Result<Self> {
        logging::set_verbosity(options.session_log_verbosity_level);

        let transformers = TransformerManager::with_defaults(
            options.max_num_graph_transformation_steps,
            options.enable_default_transformers,
        );

        // The pool only serves the parallel executor; a sequential session
        // never needs one.
        let pool = if options.enable_sequential_execution {
            None
        } else {
            let size = if options.session_thread_pool_size == 0 {
                (std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(2)
                    / 2)
                .max(1)
            } else {
                options.session_thread_pool_size
            };
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(size)
                .build()
                .map_err(|err| anyhow!("failed to build session threadpool: {}", err))?;
            Some(Arc::new(pool))
        };

        let profiler = Profiler::new();
        if options.enable_profiling {
            profiler.start_profiling(&options.profile_file_prefix);
        }

        Ok(Session {
            options,
            transformers,
            providers: ExecutionProviders::new(),
            pool,
            profiler,
            model: None,
            state: None,
            required_input_names: HashSet::new(),
            model_input_names: HashSet::new(),
            model_output_names: Vec::new(),
            current_num_runs: AtomicUsize::new(0),
        })
    }

    pub fn register_execution_provider(
        &mut self,
        provider: Arc<dyn ExecutionProvider>,
    ) -> Result<()> {
        if self.state.is_some() {
            return Err(EngineError::fail(
                "execution providers must be registered before Initialize",
            ));
        }
        crate::trace!("adding execution provider of type {}", provider.id());
        self.providers.add(provider);
        Ok(())
    }

    pub fn register_graph_transformer(
        &mut self,
        transformer: Box<dyn GraphTransformer>,
    ) -> Result<()> {
        if self.state.is_some() {
            return Err(EngineError::fail(
                "graph transformers must be registered before Initialize",
            ));
        }
        self.transformers.register(transformer);
        Ok(())
    }

    /// Load a parsed model into the session. A session holds one model.
    pub fn load(&mut self, model: Model) -> Result<()> {
        let begin = self.profiler.start_time();
        if self.model.is_some() {
            crate::error!("this session already contains a loaded model");
            return Err(anyhow::Error::new(EngineError::ModelAlreadyLoaded));
        }

        self.required_input_names = model
            .graph
            .required_inputs()
            .into_iter()
            .cloned()
            .collect();
        self.model_input_names = model.graph.inputs().iter().cloned().collect();
        self.model_output_names = model.graph.outputs().to_vec();
        self.model = Some(model);

        crate::trace!("model successfully loaded");
        self.profiler.record("session", "model_loading", begin);
        Ok(())
    }

    pub fn load_from_json(&mut self, text: &str) -> Result<()> {
        let model = Model::from_json(text)?;
        self.load(model)
    }

    /// Rewrite the graph, build the allocation plan, resolve kernels, and
    /// prepare subgraph session states. Idempotent.
    pub fn initialize(&mut self) -> Result<()> {
        let begin = self.profiler.start_time();
        let Some(model) = self.model.as_ref() else {
            crate::error!("model was not loaded");
            return Err(EngineError::fail("model was not loaded"));
        };
        if self.state.is_some() {
            crate::trace!("session has already been initialized");
            return Ok(());
        }

        if !self.providers.contains(CPU_PROVIDER) {
            crate::trace!("adding default CPU execution provider");
            self.providers.add(Arc::new(CpuExecutionProvider::new(
                self.options.enable_cpu_mem_arena,
            )));
        }

        let logid = if self.options.session_logid.is_empty() {
            "inference_session".to_string()
        } else {
            self.options.session_logid.clone()
        };

        let state = build_session_state(
            model.graph.clone(),
            self.providers.clone(),
            Some(&self.transformers),
            self.options.enable_mem_pattern,
            logid,
        )?;

        if !state.external_inputs().is_empty() {
            return Err(EngineError::invalid_model(format!(
                "graph references undefined values: {:?}",
                state.external_inputs()
            )));
        }

        self.state = Some(state);
        crate::trace!("session successfully initialized");
        self.profiler.record("session", "session_initialization", begin);
        Ok(())
    }

    pub fn run(
        &self,
        feeds: &HashMap<String, MlValue>,
        output_names: &[String],
    ) -> Result<Vec<MlValue>> {
        let mut fetches = Vec::new();
        self.run_with_options(&RunOptions::default(), feeds, output_names, &mut fetches)?;
        Ok(fetches)
    }

    /// Run the loaded model. `fetches` may be pre-sized with pre-allocated
    /// destination tensors; empty or unallocated entries are filled by the
    /// session, defaulting to CPU placement.
    pub fn run_with_options(
        &self,
        run_options: &RunOptions,
        feeds: &HashMap<String, MlValue>,
        output_names: &[String],
        fetches: &mut Vec<MlValue>,
    ) -> Result<()> {
        let begin = self.profiler.start_time();
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| EngineError::fail("session not initialized"))?;

        self.validate_inputs(state, feeds)?;
        self.validate_outputs(output_names, fetches)?;

        let run_logid = self.run_log_tag(run_options);
        if !run_options.run_tag.is_empty() {
            crate::trace!("[{}] running with tag {}", run_logid, run_options.run_tag);
        }
        if run_options.run_log_verbosity_level > 0 {
            logging::set_verbosity(run_options.run_log_verbosity_level);
        }

        self.current_num_runs.fetch_add(1, Ordering::Relaxed);
        let result = self.run_inner(run_options, state, feeds, output_names, fetches, &run_logid);
        self.current_num_runs.fetch_sub(1, Ordering::Relaxed);

        self.profiler.record("session", "model_run", begin);
        result.map_err(classify_run_error)
    }

    fn run_inner(
        &self,
        run_options: &RunOptions,
        state: &Arc<SessionState>,
        feeds: &HashMap<String, MlValue>,
        output_names: &[String],
        fetches: &mut Vec<MlValue>,
        run_logid: &str,
    ) -> Result<()> {
        for provider in self.providers.iter() {
            provider.on_run_start()?;
        }

        let run_result = (|| -> Result<Vec<MlValue>> {
            let copied_feeds = copy_inputs_across_devices(state, feeds)?;
            let shape_key = input_shape_key(&copied_feeds);

            // Pattern offsets reuse freed intervals under the sequential
            // order; only the sequential executor is guaranteed to honor
            // those lifetimes, so realization is gated on it.
            let pattern = if state.mem_pattern_enabled() && self.options.enable_sequential_execution
            {
                shape_key.as_ref().and_then(|key| state.cached_pattern(key))
            } else {
                None
            };

            let terminate = run_options
                .terminate
                .clone()
                .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));

            let frame = ExecutionFrame::new(state, &copied_feeds, output_names, pattern)?;

            let fetched = if self.options.enable_sequential_execution {
                SequentialExecutor::new(terminate).execute(state, &frame, output_names)?
            } else {
                let pool = self
                    .pool
                    .clone()
                    .ok_or_else(|| EngineError::fail("parallel session has no thread pool"))?;
                ParallelExecutor::new(pool, terminate).execute(state, &frame, output_names)?
            };

            // First run with a new input-shape tuple: emit the observed
            // layout so subsequent runs realize one arena per device.
            if state.mem_pattern_enabled() && !frame.has_pattern() {
                if let Some(key) = shape_key {
                    crate::trace!("[{}] caching memory pattern", run_logid);
                    state.update_pattern_cache(key, frame.generate_patterns()?);
                }
            }

            Ok(fetched)
        })();

        for provider in self.providers.iter() {
            if let Err(err) = provider.on_run_end() {
                crate::warning!("[{}] provider run-end failed: {}", run_logid, err);
            }
        }

        let fetched = run_result?;
        copy_outputs_across_devices(state, fetched, fetches)
    }

    fn run_log_tag(&self, run_options: &RunOptions) -> String {
        let mut tag = self.options.session_logid.clone();
        if !tag.is_empty() && !run_options.run_tag.is_empty() {
            tag.push(':');
        }
        tag.push_str(&run_options.run_tag);
        tag
    }

    fn validate_inputs(&self, state: &SessionState, feeds: &HashMap<String, MlValue>) -> Result<()> {
        let missing: Vec<&String> = self
            .required_input_names
            .iter()
            .filter(|name| !feeds.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            let mut names: Vec<&str> = missing.iter().map(|s| s.as_str()).collect();
            names.sort_unstable();
            return Err(EngineError::invalid_argument(format!(
                "missing required inputs: {}",
                names.join(",")
            )));
        }

        let invalid: Vec<&str> = feeds
            .keys()
            .filter(|name| !self.model_input_names.contains(*name))
            .map(|s| s.as_str())
            .collect();
        if !invalid.is_empty() {
            let mut valid: Vec<&str> =
                self.model_input_names.iter().map(|s| s.as_str()).collect();
            valid.sort_unstable();
            return Err(EngineError::invalid_argument(format!(
                "invalid feed input names: {}. valid input names are: {}",
                invalid.join(" "),
                valid.join(" ")
            )));
        }

        for (name, value) in feeds {
            let MlValue::Tensor(tensor) = value else { continue };
            let declared = state.graph().value_info(name).cloned();
            if let Some(ValueInfo {
                dtype: Some(expected),
                ..
            }) = declared
            {
                let actual = tensor
                    .lock()
                    .map_err(|_| anyhow!("tensor lock poisoned"))?
                    .dtype();
                if actual != expected {
                    return Err(EngineError::invalid_argument(format!(
                        "unexpected input data type for {}. actual: {}, expected: {}",
                        name, actual, expected
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_outputs(&self, output_names: &[String], fetches: &[MlValue]) -> Result<()> {
        if output_names.is_empty() {
            return Err(EngineError::invalid_argument(
                "at least one output should be requested",
            ));
        }
        if !fetches.is_empty() && fetches.len() != output_names.len() {
            return Err(EngineError::invalid_argument(format!(
                "output vector incorrectly sized: output_names.size(): {}, fetches.size(): {}",
                output_names.len(),
                fetches.len()
            )));
        }
        let invalid: Vec<&str> = output_names
            .iter()
            .filter(|name| !self.model_output_names.contains(*name))
            .map(|s| s.as_str())
            .collect();
        if !invalid.is_empty() {
            return Err(EngineError::invalid_argument(format!(
                "invalid output names: {}. valid output names are: {}",
                invalid.join(" "),
                self.model_output_names.join(" ")
            )));
        }
        Ok(())
    }

    pub fn current_num_runs(&self) -> usize {
        self.current_num_runs.load(Ordering::Relaxed)
    }

    /// Immutable execution state; available after `initialize`.
    pub fn state(&self) -> Option<&Arc<SessionState>> {
        self.state.as_ref()
    }

    pub fn model_outputs(&self) -> &[String] {
        &self.model_output_names
    }

    pub fn start_profiling(&self, file_prefix: &str) {
        self.profiler.start_profiling(file_prefix);
    }

    pub fn end_profiling(&self) -> Option<String> {
        self.profiler.end_profiling()
    }
}

/// Copy feeds whose storage location differs from where their consumers
/// expect them; same-provider feeds pass straight through.
fn copy_inputs_across_devices(
    state: &SessionState,
    feeds: &HashMap<String, MlValue>,
) -> Result<HashMap<String, MlValue>> {
    let mut copied = HashMap::with_capacity(feeds.len());
    for (name, value) in feeds {
        let MlValue::Tensor(shared) = value else {
            copied.insert(name.clone(), value.clone());
            continue;
        };
        let index = state.plan().index_of(name)?;
        let expected = state.plan().locations[index];
        let tensor = shared.lock().map_err(|_| anyhow!("tensor lock poisoned"))?;
        if tensor.location().provider == expected.provider {
            copied.insert(name.clone(), value.clone());
            continue;
        }
        let provider = state.providers().get_or_cpu(expected.provider)?;
        let mut destination =
            crate::tensor::Tensor::zeros_at(tensor.dtype(), tensor.shape(), expected);
        provider.copy_tensor(&tensor, &mut destination)?;
        copied.insert(name.clone(), MlValue::from_tensor(destination));
    }
    Ok(copied)
}

/// Copy fetched values back to the caller's expected location, defaulting
/// to CPU when the caller pre-allocated nothing.
fn copy_outputs_across_devices(
    state: &SessionState,
    fetched: Vec<MlValue>,
    user_fetches: &mut Vec<MlValue>,
) -> Result<()> {
    if user_fetches.is_empty() {
        user_fetches.resize(fetched.len(), MlValue::Unallocated);
    }
    for (index, value) in fetched.into_iter().enumerate() {
        let MlValue::Tensor(shared) = &value else {
            user_fetches[index] = value;
            continue;
        };
        let tensor = shared.lock().map_err(|_| anyhow!("tensor lock poisoned"))?;

        match &user_fetches[index] {
            MlValue::Tensor(preallocated) => {
                // The producing provider owns the transfer into the
                // caller's buffer, wherever that buffer lives.
                let mut destination = preallocated
                    .lock()
                    .map_err(|_| anyhow!("tensor lock poisoned"))?;
                let provider = state.providers().get_or_cpu(tensor.location().provider)?;
                provider.copy_tensor(&tensor, &mut destination)?;
            }
            _ => {
                if tensor.location().provider == CPU_PROVIDER {
                    drop(tensor);
                    user_fetches[index] = value;
                } else {
                    let provider = state.providers().get_or_cpu(tensor.location().provider)?;
                    let mut destination = crate::tensor::Tensor::zeros_at(
                        tensor.dtype(),
                        tensor.shape(),
                        crate::tensor::MemoryInfo::cpu_default(),
                    );
                    provider.copy_tensor(&tensor, &mut destination)?;
                    user_fetches[index] = MlValue::from_tensor(destination);
                }
            }
        }
    }
    Ok(())
}

/// Shape tuple keying the memory-pattern cache: sorted feed names with
/// their tensor shapes. Any non-tensor feed disables pattern caching for
/// the run.
fn input_shape_key(feeds: &HashMap<String, MlValue>) -> Option<Vec<Vec<usize>>> {
    let mut names: Vec<&String> = feeds.keys().collect();
    names.sort();
    let mut key = Vec::with_capacity(names.len());
    for name in names {
        match feeds.get(name) {
            Some(MlValue::Tensor(shared)) => {
                let tensor = shared.lock().ok()?;
                key.push(tensor.shape().to_vec());
            }
            _ => return None,
        }
    }
    Some(key)
}

/// Errors escaping a run without an explicit kind are surfaced as runtime
/// exceptions; the session stays usable for subsequent runs.
fn classify_run_error(err: anyhow::Error) -> anyhow::Error {
    if err.downcast_ref::<EngineError>().is_some() {
        err
    } else {
        err.context(EngineError::RuntimeException(
            "encountered unexpected error in Run()".to_string(),
        ))
    }
}

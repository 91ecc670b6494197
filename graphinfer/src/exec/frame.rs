//! Per-run storage owning all non-initializer values.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::tensor::{ArenaBuffer, DType, MlValue, ProviderId, SharedTensor, Tensor};

use super::fence::Fence;
use super::pattern::{plan_offsets, MemoryPattern, MemoryPatternGroup};
use super::plan::{SequentialPlan, ValueKind};
use super::state::SessionState;

pub struct ExecutionFrame {
    plan: Arc<SequentialPlan>,
    slots: Vec<Mutex<MlValue>>,
    fences: Vec<Option<Arc<Fence>>>,
    /// Remaining consumer references; a computed value is released when its
    /// count reaches zero, unless it is fetched.
    release_refs: Mutex<Vec<usize>>,
    arenas: HashMap<(ProviderId, i32), Arc<ArenaBuffer>>,
    pattern: Option<Arc<MemoryPatternGroup>>,
    observed_nbytes: Mutex<Vec<Option<usize>>>,
    creations: AtomicUsize,
    arena_allocations: usize,
    fetches: HashSet<usize>,
}

impl ExecutionFrame {
    pub fn new(
        state: &SessionState,
        feeds: &HashMap<String, MlValue>,
        output_names: &[String],
        pattern: Option<Arc<MemoryPatternGroup>>,
    ) -> Result<Self> {
        let plan = Arc::clone(state.plan());
        let num_values = plan.num_values();

        let mut slots = Vec::with_capacity(num_values);
        for _ in 0..num_values {
            slots.push(Mutex::new(MlValue::Unallocated));
        }

        // Fences are created up front so every consumer observes the same
        // handle the producer publishes through.
        let mut fences = Vec::with_capacity(num_values);
        for idx in 0..num_values {
            let info = plan.locations[idx];
            let provider = state.providers().get_or_cpu(info.provider)?;
            fences.push(provider.create_fence(&info));
        }

        let mut fetches = HashSet::new();
        for name in output_names {
            fetches.insert(plan.index_of(name)?);
        }

        // Realize one arena per device covered by the cached pattern.
        let mut arenas = HashMap::new();
        let mut arena_allocations = 0;
        if let Some(group) = pattern.as_deref() {
            for (&device, device_pattern) in &group.per_device {
                if device_pattern.total == 0 {
                    continue;
                }
                let provider = state.providers().get_or_cpu(device.0)?;
                arenas.insert(device, provider.allocate_arena(device_pattern.total));
                arena_allocations += 1;
            }
        }

        let frame = ExecutionFrame {
            release_refs: Mutex::new(plan.consumer_counts.clone()),
            observed_nbytes: Mutex::new(vec![None; num_values]),
            plan,
            slots,
            fences,
            arenas,
            pattern,
            creations: AtomicUsize::new(0),
            arena_allocations,
            fetches,
        };

        // Seed initializers.
        for (&idx, tensor) in &state.initializer_values {
            *frame.slot(idx)? = MlValue::Tensor(Arc::clone(tensor));
        }
        // Seed feeds; a feed may legally shadow a same-named initializer.
        for (name, value) in feeds {
            let idx = frame.plan.index_of(name)?;
            *frame.slot(idx)? = value.clone();
        }

        Ok(frame)
    }

    fn slot(&self, index: usize) -> Result<std::sync::MutexGuard<'_, MlValue>> {
        self.slots
            .get(index)
            .ok_or_else(|| anyhow!("value index {} out of range", index))?
            .lock()
            .map_err(|_| anyhow!("value slot poisoned"))
    }

    pub fn plan(&self) -> &Arc<SequentialPlan> {
        &self.plan
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.plan.index_of(name)
    }

    pub fn value(&self, index: usize) -> Result<MlValue> {
        Ok(self.slot(index)?.clone())
    }

    pub fn value_by_name(&self, name: &str) -> Result<MlValue> {
        self.value(self.index_of(name)?)
    }

    /// Tensor handle for `index`, creating the storage on first call.
    ///
    /// Creation happens at most once per run; a second call returns the
    /// existing handle. Storage comes from the device arena when the cached
    /// memory pattern covers the value, otherwise from an owned allocation.
    pub fn get_or_create(&self, index: usize, dtype: DType, shape: &[usize]) -> Result<SharedTensor> {
        let mut slot = self.slot(index)?;
        match &*slot {
            MlValue::Tensor(tensor) => return Ok(Arc::clone(tensor)),
            MlValue::Unallocated => {}
            _ => return Err(anyhow!("value {} holds a non-tensor", index)),
        }

        let location = self.plan.locations[index];
        let nbytes = shape.iter().product::<usize>() * dtype.size();
        let tensor = match self.arena_entry(index, nbytes) {
            Some((arena, offset)) => Tensor::from_arena(dtype, shape, arena, offset, location)?,
            None => Tensor::zeros_at(dtype, shape, location),
        };

        self.observed_nbytes
            .lock()
            .map_err(|_| anyhow!("observed sizes poisoned"))?[index] = Some(nbytes);
        self.creations.fetch_add(1, Ordering::Relaxed);

        let shared = Arc::new(Mutex::new(tensor));
        *slot = MlValue::Tensor(Arc::clone(&shared));
        Ok(shared)
    }

    fn arena_entry(&self, index: usize, nbytes: usize) -> Option<(Arc<ArenaBuffer>, usize)> {
        let group = self.pattern.as_deref()?;
        let device = self.plan.locations[index].device_key();
        let (offset, reserved) = *group.pattern_for(device)?.entries.get(&index)?;
        if nbytes > reserved {
            return None;
        }
        let arena = self.arenas.get(&device)?;
        Some((Arc::clone(arena), offset))
    }

    /// Drop a computed intermediate. Idempotent; fetched values, feeds, and
    /// initializers are never dropped.
    pub fn release_value(&self, index: usize) -> Result<()> {
        if self.fetches.contains(&index)
            || self.plan.kinds[index] != ValueKind::Computed
            || self.plan.lifetimes[index].1 == super::plan::LIFETIME_END
        {
            return Ok(());
        }
        *self.slot(index)? = MlValue::Unallocated;
        Ok(())
    }

    /// Note that one consumer of `index` has completed; releases the value
    /// when the last consumer is done.
    pub fn decrement_value_ref(&self, index: usize) -> Result<()> {
        let release = {
            let mut refs = self
                .release_refs
                .lock()
                .map_err(|_| anyhow!("release refs poisoned"))?;
            match refs.get_mut(index) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    *count == 0
                }
                _ => false,
            }
        };
        if release {
            self.release_value(index)?;
        }
        Ok(())
    }

    pub fn fence(&self, index: usize) -> Option<Arc<Fence>> {
        self.fences.get(index).and_then(|f| f.clone())
    }

    pub fn fences_for<'a>(
        &self,
        names: impl Iterator<Item = &'a String>,
    ) -> Result<Vec<Option<Arc<Fence>>>> {
        names
            .map(|name| Ok(self.fence(self.index_of(name)?)))
            .collect()
    }

    /// Read the requested outputs out of the frame.
    pub fn fetch(&self, output_names: &[String]) -> Result<Vec<MlValue>> {
        let mut out = Vec::with_capacity(output_names.len());
        for name in output_names {
            let value = self.value_by_name(name)?;
            if !value.is_allocated() {
                return Err(anyhow!("requested output {} was not produced", name));
            }
            out.push(value);
        }
        Ok(out)
    }

    /// Emit the memory layout observed during this run, one pattern per
    /// device, covering computed values placed in default memory.
    pub fn generate_patterns(&self) -> Result<MemoryPatternGroup> {
        let observed = self
            .observed_nbytes
            .lock()
            .map_err(|_| anyhow!("observed sizes poisoned"))?;

        let mut per_device: HashMap<(ProviderId, i32), Vec<(usize, usize)>> = HashMap::new();
        for (index, nbytes) in observed.iter().enumerate() {
            let Some(nbytes) = nbytes else { continue };
            if self.plan.kinds[index] != ValueKind::Computed || self.fetches.contains(&index) {
                continue;
            }
            if self.plan.lifetimes[index].1 == super::plan::LIFETIME_END {
                continue;
            }
            per_device
                .entry(self.plan.locations[index].device_key())
                .or_default()
                .push((index, *nbytes));
        }

        let mut group = MemoryPatternGroup::default();
        for (device, sizes) in per_device {
            let pattern: MemoryPattern = plan_offsets(&sizes, &self.plan);
            group.per_device.insert(device, pattern);
        }
        Ok(group)
    }

    pub fn has_pattern(&self) -> bool {
        self.pattern.is_some()
    }

    /// Arena allocations performed for this run; exactly one per device on a
    /// pattern hit.
    pub fn arena_allocation_count(&self) -> usize {
        self.arena_allocations
    }

    /// Total value creations performed by this run.
    pub fn creation_count(&self) -> usize {
        self.creations.load(Ordering::Relaxed)
    }
}

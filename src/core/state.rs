//! Shard state: the per-neuron arrays and axon table one shard owns.
//!
//! One instance exists per shard. The loader builds it once from a quantized
//! artifact; afterwards only the compute engine and the inbox-merge path
//! mutate it. Layout is flat parallel arrays with index-based axon ranges per
//! neuron; no per-neuron heap objects in the hot path.

use crate::address::{NeuronAddr, REGION_COUNT};
use crate::quant::QuantMap;
use crate::rng::mix_seed;

/// Accumulation function codes stored per neuron.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumFn {
    None,
    Sum,
    Product,
    Max,
}

impl AccumFn {
    pub const NONE: u8 = 0;
    pub const SUM: u8 = 1;
    pub const PRODUCT: u8 = 2;
    pub const MAX: u8 = 3;

    /// Unknown codes behave as Sum so newer artifacts stay usable.
    pub fn from_code(code: u8) -> Self {
        match code {
            Self::NONE => AccumFn::None,
            Self::PRODUCT => AccumFn::Product,
            Self::MAX => AccumFn::Max,
            _ => AccumFn::Sum,
        }
    }
}

/// Flat axon table shared by all neurons of a shard.
///
/// Parallel arrays indexed `[0, len)`; neuron `i` owns the index range
/// `axon_start[i] .. axon_start[i] + axon_count[i]`.
#[derive(Debug, Clone, Default)]
pub struct AxonTable {
    pub target_region: Vec<u8>,
    pub target_neuron: Vec<u32>,
    /// Decoded working strength. Drifts under plasticity.
    pub strength: Vec<f32>,
    /// Strength code as stored in the artifact.
    pub base_code: Vec<u8>,
    /// Current strength code; differs from `base_code` once drifted.
    pub runtime_code: Vec<u8>,
    /// True while `runtime_code != base_code`.
    pub drifted: Vec<bool>,
    /// Packed source address, for diagnostics and deterministic draws.
    pub from_addr: Vec<u32>,
    /// Packed target address.
    pub to_addr: Vec<u32>,
}

impl AxonTable {
    pub fn len(&self) -> usize {
        self.strength.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strength.is_empty()
    }

    fn assert_coherent(&self) {
        let n = self.strength.len();
        assert!(
            self.target_region.len() == n
                && self.target_neuron.len() == n
                && self.base_code.len() == n
                && self.runtime_code.len() == n
                && self.drifted.len() == n
                && self.from_addr.len() == n
                && self.to_addr.len() == n,
            "axon table arrays must have identical length"
        );
    }
}

/// Everything a loader must supply to stand up a shard.
///
/// Plain public fields, consumed by [`ShardState::new`]; length invariants
/// are asserted there, so a corrupt artifact fails fast instead of
/// mis-simulating.
#[derive(Debug, Clone)]
pub struct ShardInit {
    pub region_id: u8,
    pub neuron_start: u32,
    pub brain_seed: u64,
    pub strength_quant: QuantMap,
    pub strength_bits: u32,
    /// Neuron count per region across the whole brain, for wrap distances.
    pub region_spans: [u32; REGION_COUNT],

    pub buffer: Vec<f32>,
    pub enabled: Vec<bool>,
    pub exists: Vec<bool>,
    pub accum_fn: Vec<u8>,
    pub activation_fn: Vec<u8>,
    pub reset_fn: Vec<u8>,
    pub param_a: Vec<f32>,
    pub param_b: Vec<f32>,
    pub pre_threshold: Vec<f32>,
    pub fire_threshold: Vec<f32>,
    pub axon_count: Vec<u16>,
    pub axon_start: Vec<u32>,
    pub axons: AxonTable,
}

/// Exclusive per-shard simulation state.
#[derive(Debug, Clone)]
pub struct ShardState {
    region_id: u8,
    neuron_start: u32,
    neuron_count: usize,
    brain_seed: u64,
    strength_quant: QuantMap,
    strength_bits: u32,
    region_spans: [u32; REGION_COUNT],

    pub(crate) buffer: Vec<f32>,
    pub(crate) enabled: Vec<bool>,
    pub(crate) exists: Vec<bool>,
    pub(crate) accum_fn: Vec<u8>,
    pub(crate) activation_fn: Vec<u8>,
    pub(crate) reset_fn: Vec<u8>,
    pub(crate) param_a: Vec<f32>,
    pub(crate) param_b: Vec<f32>,
    pub(crate) pre_threshold: Vec<f32>,
    pub(crate) fire_threshold: Vec<f32>,
    pub(crate) axon_count: Vec<u16>,
    pub(crate) axon_start: Vec<u32>,
    pub(crate) axons: AxonTable,

    // Asynchronous inbox: written between ticks by incoming signal batches,
    // drained exactly once per tick by the engine's merge pass.
    pub(crate) inbox: Vec<f32>,
    pub(crate) inbox_has_input: Vec<bool>,
}

impl ShardState {
    pub fn new(init: ShardInit) -> Self {
        let n = init.buffer.len();
        assert!(
            (init.region_id as usize) < REGION_COUNT,
            "region id must be < {}",
            REGION_COUNT
        );
        assert!(
            init.enabled.len() == n
                && init.exists.len() == n
                && init.accum_fn.len() == n
                && init.activation_fn.len() == n
                && init.reset_fn.len() == n
                && init.param_a.len() == n
                && init.param_b.len() == n
                && init.pre_threshold.len() == n
                && init.fire_threshold.len() == n
                && init.axon_count.len() == n
                && init.axon_start.len() == n,
            "per-neuron arrays must match neuron count"
        );
        assert!(
            (1..=8).contains(&init.strength_bits),
            "strength codes are stored as bytes"
        );
        init.axons.assert_coherent();

        let mut expected_axons = 0usize;
        for i in 0..n {
            assert_eq!(
                init.axon_start[i] as usize, expected_axons,
                "axon ranges must partition the table in neuron order"
            );
            expected_axons += init.axon_count[i] as usize;
        }
        assert_eq!(
            init.axons.len(),
            expected_axons,
            "axon table length must match summed axon counts"
        );

        Self {
            region_id: init.region_id,
            neuron_start: init.neuron_start,
            neuron_count: n,
            brain_seed: init.brain_seed,
            strength_quant: init.strength_quant,
            strength_bits: init.strength_bits,
            region_spans: init.region_spans,
            buffer: init.buffer,
            enabled: init.enabled,
            exists: init.exists,
            accum_fn: init.accum_fn,
            activation_fn: init.activation_fn,
            reset_fn: init.reset_fn,
            param_a: init.param_a,
            param_b: init.param_b,
            pre_threshold: init.pre_threshold,
            fire_threshold: init.fire_threshold,
            axon_count: init.axon_count,
            axon_start: init.axon_start,
            axons: init.axons,
            inbox: vec![0.0; n],
            inbox_has_input: vec![false; n],
        }
    }

    pub fn region_id(&self) -> u8 {
        self.region_id
    }

    pub fn neuron_start(&self) -> u32 {
        self.neuron_start
    }

    pub fn neuron_count(&self) -> usize {
        self.neuron_count
    }

    pub fn brain_seed(&self) -> u64 {
        self.brain_seed
    }

    pub fn strength_quant(&self) -> &QuantMap {
        &self.strength_quant
    }

    pub fn strength_bits(&self) -> u32 {
        self.strength_bits
    }

    pub fn region_spans(&self) -> &[u32; REGION_COUNT] {
        &self.region_spans
    }

    pub fn is_output_region(&self) -> bool {
        self.region_id == crate::address::OUTPUT_REGION
    }

    pub fn buffer(&self) -> &[f32] {
        &self.buffer
    }

    pub fn enabled(&self) -> &[bool] {
        &self.enabled
    }

    pub fn axons(&self) -> &AxonTable {
        &self.axons
    }

    /// Packed global address of a local neuron.
    pub fn neuron_addr(&self, local_index: usize) -> NeuronAddr {
        NeuronAddr::new(self.region_id, self.neuron_start + local_index as u32)
    }

    /// Deterministic draw seed for one axon at one tick.
    pub fn axon_seed(&self, tick_id: u64, axon_index: usize) -> u64 {
        mix_seed(
            self.brain_seed,
            tick_id,
            self.axons.from_addr[axon_index],
            self.axons.to_addr[axon_index],
        )
    }

    /// Merge a cross-shard contribution into the inbox.
    ///
    /// Target ids outside this shard's range are silently ignored:
    /// misrouting between shards must never crash a shard. Merge semantics
    /// follow the target neuron's accumulation function.
    pub fn apply_contribution(&mut self, target_neuron_id: u32, value: f32) {
        let Some(local) = self.local_index(target_neuron_id) else {
            return;
        };

        match AccumFn::from_code(self.accum_fn[local]) {
            AccumFn::Sum => self.inbox[local] += value,
            AccumFn::Product => {
                if self.inbox_has_input[local] {
                    self.inbox[local] *= value;
                } else {
                    self.inbox[local] = value;
                    self.inbox_has_input[local] = true;
                }
            }
            AccumFn::Max => {
                if !self.inbox_has_input[local] {
                    self.inbox[local] = value;
                    self.inbox_has_input[local] = true;
                } else if value > self.inbox[local] {
                    self.inbox[local] = value;
                }
            }
            AccumFn::None => {}
        }
    }

    /// Externally injected contribution (the IO gateway's input path).
    /// Non-finite values are refused. Returns whether the pulse applied.
    pub fn apply_runtime_pulse(&mut self, target_neuron_id: u32, value: f32) -> bool {
        if !value.is_finite() || self.local_index(target_neuron_id).is_none() {
            return false;
        }
        self.apply_contribution(target_neuron_id, value);
        true
    }

    /// Direct neuron state write used by debug tooling. Non-finite values
    /// are refused; either field may be written independently.
    pub fn set_runtime_state(
        &mut self,
        target_neuron_id: u32,
        buffer: Option<f32>,
        accumulator: Option<f32>,
    ) -> bool {
        if buffer.is_none() && accumulator.is_none() {
            return false;
        }
        if buffer.is_some_and(|v| !v.is_finite())
            || accumulator.is_some_and(|v| !v.is_finite())
        {
            return false;
        }
        let Some(local) = self.local_index(target_neuron_id) else {
            return false;
        };

        if let Some(v) = buffer {
            self.buffer[local] = v;
        }
        if let Some(v) = accumulator {
            self.inbox[local] = v;
            self.inbox_has_input[local] = true;
        }
        true
    }

    fn local_index(&self, target_neuron_id: u32) -> Option<usize> {
        let local = target_neuron_id.checked_sub(self.neuron_start)? as usize;
        (local < self.neuron_count).then_some(local)
    }
}

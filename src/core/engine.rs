//! Per-tick compute engine.
//!
//! Consumes one shard's state plus a routing table and per-call configuration
//! bundles, and produces the tick's outbox, output events, cost totals and
//! diagnostic streams. This is the hot path: it runs for every neuron, every
//! axon, every tick, on every shard, so it sanitizes instead of erroring and
//! allocates only the per-tick result collections.

use hashbrown::HashMap;

use crate::address::{region_z, NeuronAddr, ShardId};
use crate::quant::{buffer_map, BUFFER_BITS};
use crate::rng::{mix_seed, unit_interval};
use crate::state::{AccumFn, ShardState};
use crate::routing::RoutingTable;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Configuration bundles (passed per compute call, never held globally)
// ---------------------------------------------------------------------------

/// Homeostasis target selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum HomeostasisTarget {
    #[default]
    Zero,
    Fixed,
}

/// Homeostasis update mechanism.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum HomeostasisUpdate {
    #[default]
    ProbabilisticQuantizedStep,
}

/// Couples homeostasis pressure to the shard's energy spend.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EnergyCoupling {
    pub enabled: bool,
    pub target_scale: f32,
    pub probability_scale: f32,
}

impl Default for EnergyCoupling {
    fn default() -> Self {
        Self {
            enabled: false,
            target_scale: 1.0,
            probability_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HomeostasisConfig {
    pub enabled: bool,
    pub target: HomeostasisTarget,
    pub update: HomeostasisUpdate,
    pub base_probability: f32,
    pub min_step_codes: u32,
    pub energy: EnergyCoupling,
}

impl Default for HomeostasisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target: HomeostasisTarget::Zero,
            update: HomeostasisUpdate::ProbabilisticQuantizedStep,
            base_probability: 0.0,
            min_step_codes: 1,
            energy: EnergyCoupling::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PlasticityConfig {
    pub enabled: bool,
    /// Gate rate for probabilistic updates.
    pub rate: f32,
    pub probabilistic: bool,
    /// Nudge magnitude per unit of firing potential.
    pub delta: f32,
    /// Drifted-axon count that triggers a rebase; 0 disables.
    pub rebase_threshold: u32,
    /// Drifted-axon fraction that triggers a rebase; 0 disables.
    pub rebase_threshold_pct: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CostConfig {
    pub energy_enabled: bool,
    pub remote_cost_enabled: bool,
    pub remote_cost_per_batch: i64,
    pub remote_cost_per_contribution: i64,
    pub tier_a_multiplier: f32,
    pub tier_b_multiplier: f32,
    pub tier_c_multiplier: f32,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            energy_enabled: false,
            remote_cost_enabled: false,
            remote_cost_per_batch: 0,
            remote_cost_per_contribution: 0,
            tier_a_multiplier: 1.0,
            tier_b_multiplier: 1.0,
            tier_c_multiplier: 1.0,
        }
    }
}

/// Diagnostic/visualization collection scope for one compute call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VizScope {
    pub enabled: bool,
    /// When set, only neurons/routes touching this region are tracked.
    pub focus_region: Option<u8>,
}

impl VizScope {
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            focus_region: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// One scalar sent from a firing neuron's axon to a target neuron.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Contribution {
    pub target_neuron_id: u32,
    pub value: f32,
}

/// A firing neuron in the output region.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OutputEvent {
    pub output_index: u32,
    pub value: f32,
    pub tick_id: u64,
}

/// Per-route visualization sample: equal-weight running means over the
/// route's whole history (cumulative usage, not recent activity).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteActivity {
    pub from: NeuronAddr,
    pub to: NeuronAddr,
    pub mean_value: f32,
    pub mean_strength: f32,
}

/// Buffer sample emitted when a tracked neuron's buffer moved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeuronSample {
    pub source: NeuronAddr,
    pub tick_id: u64,
    pub value: f32,
}

/// A tracked neuron fired.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeuronFired {
    pub source: NeuronAddr,
    pub tick_id: u64,
    pub potential: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CostBreakdown {
    pub accum: i64,
    pub activation: i64,
    pub reset: i64,
    pub distance: i64,
    pub remote: i64,
}

impl CostBreakdown {
    pub fn total(&self) -> i64 {
        self.accum + self.activation + self.reset + self.distance + self.remote
    }
}

#[derive(Debug, Clone, Default)]
pub struct ComputeResult {
    pub outbox: HashMap<ShardId, Vec<Contribution>>,
    pub output_events: Vec<OutputEvent>,
    pub output_vector: Vec<f32>,
    pub fired_count: u32,
    pub out_contribs: u32,
    pub plasticity_changes: u32,
    pub cost: CostBreakdown,
    pub route_events: Vec<RouteActivity>,
    pub buffer_events: Vec<NeuronSample>,
    pub fired_events: Vec<NeuronFired>,
}

// ---------------------------------------------------------------------------
// Activation functions
// ---------------------------------------------------------------------------

/// Activation function codes stored per neuron. The artifact loader maps
/// stored codes onto this enumeration; unknown codes activate to 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActivationFn {
    None = 0,
    Identity = 1,
    StepUp = 2,
    StepMid = 3,
    StepDown = 4,
    Abs = 5,
    Clamp1 = 6,
    Relu = 7,
    NegRelu = 8,
    Sin = 9,
    TanClamped = 10,
    Tanh = 11,
    Elu = 12,
    Exp = 13,
    PRelu = 14,
    Log = 15,
    Scale = 16,
    Offset = 17,
    Sigmoid = 18,
    Silu = 19,
    RangeClamp = 20,
    ModLeft = 21,
    ModRight = 22,
    Softplus = 23,
    Selu = 24,
    Affine = 25,
    LogBase = 26,
    Pow = 27,
    Gauss = 28,
    Quad = 29,
}

impl ActivationFn {
    pub fn from_code(code: u8) -> Self {
        use ActivationFn::*;
        match code {
            1 => Identity,
            2 => StepUp,
            3 => StepMid,
            4 => StepDown,
            5 => Abs,
            6 => Clamp1,
            7 => Relu,
            8 => NegRelu,
            9 => Sin,
            10 => TanClamped,
            11 => Tanh,
            12 => Elu,
            13 => Exp,
            14 => PRelu,
            15 => Log,
            16 => Scale,
            17 => Offset,
            18 => Sigmoid,
            19 => Silu,
            20 => RangeClamp,
            21 => ModLeft,
            22 => ModRight,
            23 => Softplus,
            24 => Selu,
            25 => Affine,
            26 => LogBase,
            27 => Pow,
            28 => Gauss,
            29 => Quad,
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Apply an activation function to a buffer value. Non-finite results
/// collapse to 0 so downstream math never sees NaN or infinity.
pub fn activate(function: ActivationFn, x: f32, a: f32, b: f32) -> f32 {
    use ActivationFn::*;
    let value = match function {
        None => 0.0,
        Identity => x,
        StepUp => {
            if x <= 0.0 {
                0.0
            } else {
                1.0
            }
        }
        StepMid => {
            if x < 0.0 {
                -1.0
            } else if x == 0.0 {
                0.0
            } else {
                1.0
            }
        }
        StepDown => {
            if x < 0.0 {
                -1.0
            } else {
                0.0
            }
        }
        Abs => x.abs(),
        Clamp1 => x.clamp(-1.0, 1.0),
        Relu => x.max(0.0),
        NegRelu => x.min(0.0),
        Sin => x.sin(),
        TanClamped => x.tan().clamp(-1.0, 1.0),
        Tanh => x.tanh(),
        Elu => {
            if x > 0.0 {
                x
            } else {
                a * (x.exp() - 1.0)
            }
        }
        Exp => x.exp(),
        PRelu => {
            if x >= 0.0 {
                x
            } else {
                a * x
            }
        }
        Log => {
            if x == 0.0 {
                0.0
            } else {
                x.ln()
            }
        }
        Scale => x * a,
        Offset => x + a,
        Sigmoid => 1.0 / (1.0 + (-x).exp()),
        Silu => x / (1.0 + (-x).exp()),
        RangeClamp => {
            if b <= a {
                0.0
            } else {
                x.clamp(a, b)
            }
        }
        ModLeft => {
            if a == 0.0 {
                0.0
            } else {
                x % a
            }
        }
        ModRight => {
            if x == 0.0 {
                0.0
            } else {
                a % x
            }
        }
        Softplus => (1.0 + x.exp()).ln(),
        Selu => {
            b * if x >= 0.0 { x } else { a * (x.exp() - 1.0) }
        }
        Affine => a * x + b,
        LogBase => {
            if a == 0.0 {
                0.0
            } else {
                x.log(a)
            }
        }
        Pow => x.powf(a),
        Gauss => (x * x).exp(),
        Quad => a * (x * x) + b * x,
    };
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Reset functions
// ---------------------------------------------------------------------------

/// Quantity a combinatorial reset starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetBase {
    Buffer = 0,
    Potential = 1,
    NegPotential = 2,
    /// `1/potential`, with `1/0 = 0`.
    InversePotential = 3,
}

/// Clamp policy a combinatorial reset ends with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetClamp {
    FireThreshold = 0,
    Unit = 1,
    BufferMagnitude = 2,
}

/// Scale factors available to combinatorial resets.
pub const RESET_SCALES: [f32; 6] = [0.01, 0.1, 0.5, 1.0, 2.0, 5.0];

pub const RESET_ZERO: u8 = 0;
pub const RESET_HOLD: u8 = 1;
pub const RESET_CLAMP_POTENTIAL: u8 = 2;
pub const RESET_DIVIDE_AXON_COUNT: u8 = 3;

const RESET_COMBO_FIRST: u8 = 4;
const RESET_COMBO_COUNT: u8 = 72;

/// Code of the combinatorial reset `(base, RESET_SCALES[scale_index], clamp)`.
///
/// The reset space is generative rather than hand-enumerated: four specials
/// followed by base-major combos over 4 bases × 6 scales × 3 clamps.
pub fn reset_combo_code(base: ResetBase, scale_index: usize, clamp: ResetClamp) -> u8 {
    assert!(scale_index < RESET_SCALES.len());
    RESET_COMBO_FIRST + (base as u8) * 18 + (scale_index as u8) * 3 + clamp as u8
}

/// Apply a reset function. Unknown codes leave the buffer unchanged;
/// non-finite results collapse to 0.
pub fn reset(code: u8, buffer: f32, potential: f32, threshold: f32, out_degree: u32) -> f32 {
    let value = match code {
        RESET_ZERO => 0.0,
        RESET_HOLD => clamp_sym(buffer, threshold),
        RESET_CLAMP_POTENTIAL => clamp_sym(buffer, potential.abs()),
        RESET_DIVIDE_AXON_COUNT => clamp_sym(buffer / out_degree.max(1) as f32, threshold),
        _ => {
            let Some(combo) = code.checked_sub(RESET_COMBO_FIRST) else {
                return buffer;
            };
            if combo >= RESET_COMBO_COUNT {
                return buffer;
            }
            let base = combo / 18;
            let scale = RESET_SCALES[(combo % 18) as usize / 3];
            let clamp = combo % 3;

            let quantity = scale
                * match base {
                    0 => buffer,
                    1 => potential,
                    2 => -potential,
                    _ => safe_inverse(potential),
                };
            match clamp {
                0 => clamp_sym(quantity, threshold),
                1 => quantity.clamp(-1.0, 1.0),
                _ => clamp_sym(quantity, buffer.abs()),
            }
        }
    };
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

// NaN-safe symmetric clamp; a NaN limit passes the value through to the
// final finiteness check.
fn clamp_sym(value: f32, limit: f32) -> f32 {
    let limit = limit.abs();
    if value > limit {
        limit
    } else if value < -limit {
        -limit
    } else {
        value
    }
}

fn safe_inverse(value: f32) -> f32 {
    if value == 0.0 {
        0.0
    } else {
        1.0 / value
    }
}

// ---------------------------------------------------------------------------
// Cost model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CostTier {
    A,
    B,
    C,
}

impl CostTier {
    fn base_units(self) -> f32 {
        match self {
            CostTier::A => 1.0,
            CostTier::B => 2.0,
            CostTier::C => 4.0,
        }
    }
}

fn activation_tier(function: ActivationFn) -> CostTier {
    use ActivationFn::*;
    match function {
        None | Identity | StepUp | StepMid | StepDown | Abs | Clamp1 | Relu | NegRelu
        | Scale | Offset | RangeClamp | Affine => CostTier::A,
        Sin | Tanh | Sigmoid | Silu | PRelu | ModLeft | ModRight => CostTier::B,
        TanClamped | Elu | Exp | Log | Softplus | Selu | LogBase | Pow | Gauss | Quad => {
            CostTier::C
        }
    }
}

fn reset_tier(code: u8) -> CostTier {
    match code {
        RESET_ZERO | RESET_HOLD | RESET_CLAMP_POTENTIAL => CostTier::A,
        RESET_DIVIDE_AXON_COUNT => CostTier::B,
        _ => match code.checked_sub(RESET_COMBO_FIRST) {
            Some(combo) if combo < RESET_COMBO_COUNT => match combo / 18 {
                0 => CostTier::A,
                3 => CostTier::C,
                _ => CostTier::B,
            },
            // Unknown codes cost the same as code 0.
            _ => CostTier::A,
        },
    }
}

fn accum_cost(accum: AccumFn) -> i64 {
    match accum {
        AccumFn::None => 0,
        AccumFn::Sum | AccumFn::Max => 1,
        AccumFn::Product => 2,
    }
}

fn tier_cost(tier: CostTier, multipliers: (f32, f32, f32)) -> i64 {
    let multiplier = match tier {
        CostTier::A => multipliers.0,
        CostTier::B => multipliers.1,
        CostTier::C => multipliers.2,
    };
    (tier.base_units() * multiplier).round() as i64
}

fn normalize_multiplier(value: f32) -> f32 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        1.0
    }
}

/// Bucketing shift for intra-region neuron-index distances.
const INTRA_DISTANCE_SHIFT: u32 = 10;
const DIST_SAME_SLICE: i64 = 1;
const DIST_SLICE_UNIT: i64 = 4;

fn contribution_distance_cost(state: &ShardState, src_neuron_global: u32, axon: usize) -> i64 {
    let dest_region = state.axons().target_region[axon];
    if dest_region == state.region_id() {
        // Within a region distance wraps around the ring of neuron indices.
        let span = state.region_spans()[dest_region as usize].max(1);
        let direct = src_neuron_global.abs_diff(state.axons().target_neuron[axon]);
        let nearest = direct.min(span.saturating_sub(direct));
        1 + (nearest >> INTRA_DISTANCE_SHIFT) as i64
    } else {
        let dz = (region_z(state.region_id()) - region_z(dest_region)).unsigned_abs() as i64;
        if dz == 0 {
            DIST_SAME_SLICE
        } else {
            DIST_SLICE_UNIT * dz
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

const BUFFER_SAMPLE_EPSILON: f32 = 1e-4;

#[derive(Debug, Clone, Copy)]
struct RouteStat {
    count: u64,
    mean_value: f32,
    mean_strength: f32,
}

/// The compute engine exclusively owns its shard's state for the shard's
/// lifetime; the only other mutation path is the inbox merge between ticks.
#[derive(Debug)]
pub struct Engine {
    state: ShardState,
    shard_id: ShardId,
    route_stats: HashMap<u64, RouteStat>,
    // NaN marks "no sample emitted yet" per neuron.
    last_buffer_sample: Vec<f32>,
    last_tick_cost: i64,
}

impl Engine {
    pub fn new(state: ShardState, shard_id: ShardId) -> Self {
        let n = state.neuron_count();
        Self {
            state,
            shard_id,
            route_stats: HashMap::new(),
            last_buffer_sample: vec![f32::NAN; n],
            last_tick_cost: 0,
        }
    }

    pub fn state(&self) -> &ShardState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ShardState {
        &mut self.state
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn last_tick_cost(&self) -> i64 {
        self.last_tick_cost
    }

    /// Advance the shard by one tick.
    pub fn compute(
        &mut self,
        tick_id: u64,
        routing: &RoutingTable,
        viz: &VizScope,
        plasticity: &PlasticityConfig,
        homeostasis: &HomeostasisConfig,
        cost_cfg: &CostConfig,
    ) -> ComputeResult {
        let Engine {
            state,
            shard_id,
            route_stats,
            last_buffer_sample,
            last_tick_cost,
        } = self;

        let n = state.neuron_count();
        let is_output = state.is_output_region();
        let multipliers = (
            normalize_multiplier(cost_cfg.tier_a_multiplier),
            normalize_multiplier(cost_cfg.tier_b_multiplier),
            normalize_multiplier(cost_cfg.tier_c_multiplier),
        );
        let energy = cost_cfg.energy_enabled;
        let track_local_viz = viz.enabled
            && viz
                .focus_region
                .map_or(true, |focus| focus == state.region_id());

        let mut result = ComputeResult {
            output_vector: if is_output { vec![0.0; n] } else { Vec::new() },
            ..ComputeResult::default()
        };

        for i in 0..n {
            let accum = merge_inbox(state, i);

            if !state.exists[i] || !state.enabled[i] {
                continue;
            }

            if energy {
                result.cost.accum += accum_cost(accum);
            }

            if !state.buffer[i].is_finite() {
                state.buffer[i] = 0.0;
            }

            if homeostasis.enabled {
                homeostasis_step(state, i, tick_id, homeostasis);
                if !state.buffer[i].is_finite() {
                    state.buffer[i] = 0.0;
                }
            }

            if track_local_viz {
                let value = state.buffer[i];
                let last = last_buffer_sample[i];
                if last.is_nan() || (value - last).abs() > BUFFER_SAMPLE_EPSILON {
                    result.buffer_events.push(NeuronSample {
                        source: state.neuron_addr(i),
                        tick_id,
                        value,
                    });
                    last_buffer_sample[i] = value;
                }
            }

            let buffer = state.buffer[i];
            if buffer <= state.pre_threshold[i] {
                continue;
            }

            let function = ActivationFn::from_code(state.activation_fn[i]);
            let potential = activate(function, buffer, state.param_a[i], state.param_b[i]);
            if energy {
                result.cost.activation += tier_cost(activation_tier(function), multipliers);
            }

            let reset_code = state.reset_fn[i];
            state.buffer[i] = reset(
                reset_code,
                buffer,
                potential,
                state.fire_threshold[i],
                state.axon_count[i] as u32,
            );
            if energy {
                result.cost.reset += tier_cost(reset_tier(reset_code), multipliers);
            }

            let fires = potential.abs() > state.fire_threshold[i];
            if is_output {
                result.output_vector[i] = potential;
                if fires {
                    result.output_events.push(OutputEvent {
                        output_index: state.neuron_start() + i as u32,
                        value: potential,
                        tick_id,
                    });
                }
            }

            if !fires {
                continue;
            }
            result.fired_count += 1;

            if track_local_viz {
                result.fired_events.push(NeuronFired {
                    source: state.neuron_addr(i),
                    tick_id,
                    potential,
                });
            }

            let axon_start = state.axon_start[i] as usize;
            let axon_end = axon_start + state.axon_count[i] as usize;
            let src_global = state.neuron_start() + i as u32;

            for ax in axon_start..axon_end {
                // Sanitize the working strength before emission; drift from
                // plasticity re-encodes below, so only correct the stored
                // code when the sanitized value moved it.
                let mut strength = state.axons.strength[ax];
                if !strength.is_finite() {
                    strength = 0.0;
                }
                strength = strength.clamp(state.strength_quant().min, state.strength_quant().max);
                state.axons.strength[ax] = strength;
                let code = state.strength_quant().encode(strength, state.strength_bits()) as u8;
                if code != state.axons.runtime_code[ax] {
                    state.axons.runtime_code[ax] = code;
                    state.axons.drifted[ax] = code != state.axons.base_code[ax];
                }

                let mut value = potential * strength;
                if !value.is_finite() {
                    value = 0.0;
                }

                let dest_region = state.axons.target_region[ax];
                let dest_neuron = state.axons.target_neuron[ax];
                let dest_shard = routing
                    .shard_for(dest_region, dest_neuron)
                    .unwrap_or_else(|| ShardId::new(dest_region, 0));

                result
                    .outbox
                    .entry(dest_shard)
                    .or_default()
                    .push(Contribution {
                        target_neuron_id: dest_neuron,
                        value,
                    });
                result.out_contribs += 1;

                if energy {
                    result.cost.distance += contribution_distance_cost(state, src_global, ax);
                }

                let track_route = viz.enabled
                    && viz.focus_region.map_or(true, |focus| {
                        focus == state.region_id() || focus == dest_region
                    });
                if track_route {
                    let from = NeuronAddr::from_raw(state.axons.from_addr[ax]);
                    let to = NeuronAddr::from_raw(state.axons.to_addr[ax]);
                    let key = ((from.raw() as u64) << 32) | to.raw() as u64;
                    let stat = route_stats.entry(key).or_insert(RouteStat {
                        count: 0,
                        mean_value: 0.0,
                        mean_strength: 0.0,
                    });
                    stat.count += 1;
                    let inv = 1.0 / stat.count as f32;
                    stat.mean_value += (value - stat.mean_value) * inv;
                    stat.mean_strength += (strength - stat.mean_strength) * inv;
                    result.route_events.push(RouteActivity {
                        from,
                        to,
                        mean_value: stat.mean_value,
                        mean_strength: stat.mean_strength,
                    });
                }

                if plasticity.enabled && plasticity_step(state, i, ax, potential, tick_id, plasticity)
                {
                    result.plasticity_changes += 1;
                }
            }
        }

        if plasticity.enabled {
            maybe_rebase(state, plasticity);
        }

        if energy && cost_cfg.remote_cost_enabled {
            let per_batch = cost_cfg.remote_cost_per_batch.max(0);
            let per_contribution = cost_cfg.remote_cost_per_contribution.max(0);
            for (dest, contributions) in &result.outbox {
                if *dest != *shard_id && !contributions.is_empty() {
                    result.cost.remote +=
                        per_batch + per_contribution * contributions.len() as i64;
                }
            }
        }

        *last_tick_cost = result.cost.total();
        result
    }
}

/// Fold the inbox into the buffer under the neuron's accumulation function
/// and clear it. Runs for every neuron, existing or not, so stale inbox
/// values can never leak into a later tick.
fn merge_inbox(state: &mut ShardState, i: usize) -> AccumFn {
    let accum = AccumFn::from_code(state.accum_fn[i]);
    match accum {
        AccumFn::Sum => state.buffer[i] += state.inbox[i],
        AccumFn::Product => {
            if state.inbox_has_input[i] {
                state.buffer[i] *= state.inbox[i];
            }
        }
        AccumFn::Max => {
            if state.inbox_has_input[i] {
                state.buffer[i] = state.buffer[i].max(state.inbox[i]);
            }
        }
        AccumFn::None => {}
    }
    state.inbox[i] = 0.0;
    state.inbox_has_input[i] = false;
    accum
}

// Every target mode currently regulates toward zero; the fixed mode exists
// in the wire contract but no fixed value is plumbed through.
fn resolve_target(config: &HomeostasisConfig) -> f32 {
    match config.target {
        HomeostasisTarget::Zero | HomeostasisTarget::Fixed => 0.0,
    }
}

fn homeostasis_step(state: &mut ShardState, i: usize, tick_id: u64, config: &HomeostasisConfig) {
    let mut probability = config.base_probability;
    let mut target = resolve_target(config);
    if config.energy.enabled {
        probability *= config.energy.probability_scale;
        target *= config.energy.target_scale;
    }
    let probability = probability.clamp(0.0, 1.0);
    if probability <= 0.0 {
        return;
    }

    let addr = state.neuron_addr(i).raw();
    let sample = unit_interval(mix_seed(state.brain_seed(), tick_id, addr, addr));
    if sample >= probability {
        return;
    }

    let map = buffer_map();
    let current = map.encode(state.buffer[i], BUFFER_BITS) as i64;
    let target_code = map.encode(target, BUFFER_BITS) as i64;
    if current == target_code {
        return;
    }

    // Step through code space toward the target, never overshooting.
    let remaining = (target_code - current).abs();
    let step = (config.min_step_codes as i64).min(remaining);
    if step <= 0 {
        return;
    }
    let next = if target_code > current {
        current + step
    } else {
        current - step
    };
    state.buffer[i] = map.decode(next as u32, BUFFER_BITS);
}

/// Nudge scale for one axon. Off-shard targets get the neutral scale; local
/// targets blend alignment with the target's current buffer, presynaptic
/// buffer magnitude, and headroom to the strength map's extreme.
fn nudge_scale(state: &ShardState, i: usize, ax: usize, potential: f32, strength: f32) -> f32 {
    if state.axons.target_region[ax] != state.region_id() {
        return 1.0;
    }
    let Some(local) = state.axons.target_neuron[ax].checked_sub(state.neuron_start()) else {
        return 1.0;
    };
    let local = local as usize;
    if local >= state.neuron_count() {
        return 1.0;
    }

    let alignment = (potential.signum() * state.buffer[local]).clamp(-1.0, 1.0);
    let presyn = state.buffer[i].abs().min(1.0);
    let max_abs = state.strength_quant().max_abs();
    let headroom = if max_abs > 0.0 {
        (1.0 - strength.abs() / max_abs).clamp(0.0, 1.0)
    } else {
        0.0
    };
    (1.0 + alignment * (0.5 + 0.5 * presyn) * headroom).clamp(0.0, 2.0)
}

/// Returns whether the axon's runtime strength code changed.
fn plasticity_step(
    state: &mut ShardState,
    i: usize,
    ax: usize,
    potential: f32,
    tick_id: u64,
    config: &PlasticityConfig,
) -> bool {
    let pot_mag = potential.abs();
    if pot_mag == 0.0 || config.delta <= 0.0 || config.rate < 0.0 {
        return false;
    }

    if config.probabilistic {
        let gate = (config.rate * pot_mag).clamp(0.0, 1.0);
        if unit_interval(state.axon_seed(tick_id, ax)) >= gate {
            return false;
        }
    }

    let strength = state.axons.strength[ax];
    let scale = nudge_scale(state, i, ax, potential, strength);
    let nudge = config.delta * pot_mag * scale;
    if nudge <= 0.0 {
        return false;
    }

    let updated = if strength == 0.0 {
        // A silent axon acquires the firing potential's direction.
        potential.signum() * nudge
    } else if (strength > 0.0) == (potential > 0.0) {
        strength + strength.signum() * nudge
    } else {
        // Opposed firing shrinks the magnitude, never flips the sign.
        strength.signum() * (strength.abs() - nudge).max(0.0)
    };

    let map = *state.strength_quant();
    let updated = updated.clamp(map.min, map.max);
    let code = map.encode(updated, state.strength_bits()) as u8;
    state.axons.strength[ax] = updated;

    if code == state.axons.runtime_code[ax] {
        return false;
    }
    state.axons.runtime_code[ax] = code;
    state.axons.drifted[ax] = code != state.axons.base_code[ax];
    true
}

/// Commit runtime codes as the new base once enough axons have drifted.
/// Bounds overlay growth between snapshots.
fn maybe_rebase(state: &mut ShardState, config: &PlasticityConfig) {
    let total = state.axons.len();
    if total == 0 {
        return;
    }
    let drifted = state.axons.drifted.iter().filter(|d| **d).count();
    if drifted == 0 {
        return;
    }

    let count_hit =
        config.rebase_threshold > 0 && drifted as u64 >= config.rebase_threshold as u64;
    let pct_hit = config.rebase_threshold_pct > 0.0
        && drifted as f32 / total as f32 >= config.rebase_threshold_pct;
    if !count_hit && !pct_hit {
        return;
    }

    for idx in 0..total {
        state.axons.base_code[idx] = state.axons.runtime_code[idx];
    }
    state.axons.drifted.fill(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::REGION_COUNT;
    use crate::quant::QuantSchema;
    use crate::state::{AccumFn, AxonTable, ShardInit};

    const STRENGTH_BITS: u32 = 5;
    const IDENTITY: u8 = ActivationFn::Identity as u8;

    fn build_state(
        region: u8,
        buffer: f32,
        pre: f32,
        threshold: f32,
        activation: u8,
        reset_code: u8,
        axon_specs: &[(u8, u32, f32)],
        seed: u64,
    ) -> ShardState {
        let schema = QuantSchema::default();
        let mut region_spans = [0u32; REGION_COUNT];
        region_spans[region as usize] = 1;

        let mut axons = AxonTable::default();
        for &(target_region, target_neuron, strength) in axon_specs {
            let code = schema.strength.encode(strength, STRENGTH_BITS) as u8;
            axons.target_region.push(target_region);
            axons.target_neuron.push(target_neuron);
            axons.strength.push(strength);
            axons.base_code.push(code);
            axons.runtime_code.push(code);
            axons.drifted.push(false);
            axons.from_addr.push(NeuronAddr::new(region, 0).raw());
            axons
                .to_addr
                .push(NeuronAddr::new(target_region, target_neuron).raw());
            let span = &mut region_spans[target_region as usize];
            *span = (*span).max(target_neuron + 1);
        }

        ShardState::new(ShardInit {
            region_id: region,
            neuron_start: 0,
            brain_seed: seed,
            strength_quant: schema.strength,
            strength_bits: STRENGTH_BITS,
            region_spans,
            buffer: vec![buffer],
            enabled: vec![true],
            exists: vec![true],
            accum_fn: vec![AccumFn::SUM],
            activation_fn: vec![activation],
            reset_fn: vec![reset_code],
            param_a: vec![0.0],
            param_b: vec![0.0],
            pre_threshold: vec![pre],
            fire_threshold: vec![threshold],
            axon_count: vec![axon_specs.len() as u16],
            axon_start: vec![0],
            axons,
        })
    }

    // Two neurons in region 8: neuron 0 drives one axon at either its local
    // neighbor (neuron 1) or a remote neuron in region 9; neuron 1 never
    // activates (pre-threshold 10) so its buffer holds still.
    fn cadence_state(local_target: bool, target_buffer: f32, strength: f32) -> ShardState {
        let schema = QuantSchema::default();
        let (dest_region, dest_neuron) = if local_target { (8u8, 1u32) } else { (9u8, 0u32) };
        let mut region_spans = [0u32; REGION_COUNT];
        region_spans[8] = 2;
        region_spans[9] = 1;

        let code = schema.strength.encode(strength, STRENGTH_BITS) as u8;
        let half_reset = reset_combo_code(ResetBase::Buffer, 2, ResetClamp::FireThreshold);
        let axons = AxonTable {
            target_region: vec![dest_region],
            target_neuron: vec![dest_neuron],
            strength: vec![strength],
            base_code: vec![code],
            runtime_code: vec![code],
            drifted: vec![false],
            from_addr: vec![NeuronAddr::new(8, 0).raw()],
            to_addr: vec![NeuronAddr::new(dest_region, dest_neuron).raw()],
        };

        ShardState::new(ShardInit {
            region_id: 8,
            neuron_start: 0,
            brain_seed: 0x8877665544332211,
            strength_quant: schema.strength,
            strength_bits: STRENGTH_BITS,
            region_spans,
            buffer: vec![0.0, target_buffer],
            enabled: vec![true, true],
            exists: vec![true, true],
            accum_fn: vec![AccumFn::SUM, AccumFn::SUM],
            activation_fn: vec![IDENTITY, IDENTITY],
            reset_fn: vec![half_reset, RESET_HOLD],
            param_a: vec![0.0, 0.0],
            param_b: vec![0.0, 0.0],
            pre_threshold: vec![0.05, 10.0],
            fire_threshold: vec![0.1, 0.9],
            axon_count: vec![1, 0],
            axon_start: vec![0, 1],
            axons,
        })
    }

    fn routing_for(state: &ShardState) -> RoutingTable {
        RoutingTable::single_shard(state.region_spans())
    }

    fn compute_simple(engine: &mut Engine, tick_id: u64, routing: &RoutingTable) -> ComputeResult {
        engine.compute(
            tick_id,
            routing,
            &VizScope::disabled(),
            &PlasticityConfig::default(),
            &HomeostasisConfig::default(),
            &CostConfig::default(),
        )
    }

    fn plasticity_cfg(rate: f32, probabilistic: bool, delta: f32) -> PlasticityConfig {
        PlasticityConfig {
            enabled: true,
            rate,
            probabilistic,
            delta,
            rebase_threshold: 0,
            rebase_threshold_pct: 0.0,
        }
    }

    fn homeostasis_cfg(base_probability: f32, min_step_codes: u32) -> HomeostasisConfig {
        HomeostasisConfig {
            enabled: true,
            base_probability,
            min_step_codes,
            ..HomeostasisConfig::default()
        }
    }

    fn compute_with_plasticity(
        engine: &mut Engine,
        tick_id: u64,
        routing: &RoutingTable,
        cfg: &PlasticityConfig,
    ) -> ComputeResult {
        engine.compute(
            tick_id,
            routing,
            &VizScope::disabled(),
            cfg,
            &HomeostasisConfig::default(),
            &CostConfig::default(),
        )
    }

    fn find_tick_with_neuron_sample(
        seed: u64,
        addr: u32,
        accept: impl Fn(f32) -> bool,
    ) -> u64 {
        (1..100_000u64)
            .find(|&tick| accept(unit_interval(mix_seed(seed, tick, addr, addr))))
            .expect("no tick with a matching deterministic sample")
    }

    fn find_tick_with_axon_sample(state: &ShardState, accept: impl Fn(f32) -> bool) -> u64 {
        (1..100_000u64)
            .find(|&tick| accept(unit_interval(state.axon_seed(tick, 0))))
            .expect("no tick with a matching deterministic sample")
    }

    #[test]
    fn single_neuron_fires_routes_and_resets() {
        let state = build_state(8, 0.0, 0.0, 0.5, IDENTITY, RESET_ZERO, &[(9, 0, 0.5)], 1);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        engine.state_mut().apply_contribution(0, 1.0);
        let result = compute_simple(&mut engine, 1, &routing);

        assert_eq!(result.fired_count, 1);
        assert_eq!(result.out_contribs, 1);
        let contributions = result.outbox.get(&ShardId::new(9, 0)).expect("routed batch");
        assert_eq!(contributions.len(), 1);
        assert_eq!(contributions[0].target_neuron_id, 0);
        assert!((contributions[0].value - 0.5).abs() < 1e-6);
        assert_eq!(engine.state().buffer()[0], 0.0, "zero reset");
    }

    #[test]
    fn pre_activation_gate_blocks_everything() {
        let state = build_state(8, 0.5, 0.9, 0.1, IDENTITY, RESET_ZERO, &[(9, 0, 0.5)], 1);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        let result = compute_simple(&mut engine, 1, &routing);
        assert_eq!(result.fired_count, 0);
        assert!(result.outbox.is_empty());
        assert_eq!(engine.state().buffer()[0], 0.5, "no reset below the gate");
    }

    #[test]
    fn sub_threshold_potential_resets_without_propagating() {
        let state = build_state(8, 0.3, 0.1, 0.5, IDENTITY, RESET_ZERO, &[(9, 0, 0.5)], 1);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        let result = compute_simple(&mut engine, 1, &routing);
        assert_eq!(result.fired_count, 0);
        assert!(result.outbox.is_empty());
        assert_eq!(engine.state().buffer()[0], 0.0, "reset ran before the fire gate");
    }

    #[test]
    fn disabled_and_missing_neurons_still_drain_their_inbox() {
        let mut state = build_state(8, 0.0, 0.0, 0.5, IDENTITY, RESET_ZERO, &[], 1);
        state.enabled[0] = false;
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        engine.state_mut().apply_contribution(0, 2.0);
        let result = compute_simple(&mut engine, 1, &routing);
        assert_eq!(result.fired_count, 0);
        engine.state_mut().apply_contribution(0, 0.0);
        // A later tick must not see the old contribution again.
        assert_eq!(engine.state().inbox[0], 0.0);
    }

    #[test]
    fn identical_state_and_tick_produce_identical_results() {
        let plasticity = PlasticityConfig {
            enabled: true,
            rate: 0.2,
            probabilistic: true,
            delta: 0.14,
            rebase_threshold: 0,
            rebase_threshold_pct: 0.0,
        };
        let homeostasis = homeostasis_cfg(0.35, 2);
        let cost = CostConfig {
            energy_enabled: true,
            remote_cost_enabled: true,
            remote_cost_per_batch: 5,
            remote_cost_per_contribution: 2,
            ..CostConfig::default()
        };

        let run = || {
            let state = cadence_state(true, 0.35, 0.2);
            let routing = routing_for(&state);
            let mut engine = Engine::new(state, ShardId::new(8, 0));
            let mut snapshots = Vec::new();
            for tick in 1..=8u64 {
                engine.state_mut().apply_contribution(0, 1.0);
                let result = engine.compute(
                    tick,
                    &routing,
                    &VizScope::disabled(),
                    &plasticity,
                    &homeostasis,
                    &cost,
                );
                let mut batches: Vec<(u32, Vec<(u32, u32)>)> = result
                    .outbox
                    .iter()
                    .map(|(shard, contribs)| {
                        (
                            shard.raw(),
                            contribs
                                .iter()
                                .map(|c| (c.target_neuron_id, c.value.to_bits()))
                                .collect(),
                        )
                    })
                    .collect();
                batches.sort();
                snapshots.push((
                    batches,
                    result.fired_count,
                    result.cost,
                    engine.state().buffer()[0].to_bits(),
                    engine.state().axons().strength[0].to_bits(),
                ));
            }
            snapshots
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn adversarial_inputs_never_emit_non_finite_values() {
        let mut state = build_state(
            8,
            f32::INFINITY,
            -1.0,
            0.5,
            ActivationFn::Exp as u8,
            RESET_ZERO,
            &[(9, 0, 0.5)],
            1,
        );
        state.axons.strength[0] = f32::NAN;
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        let result = engine.compute(
            1,
            &routing,
            &VizScope::disabled(),
            &PlasticityConfig::default(),
            &homeostasis_cfg(1.0, 1),
            &CostConfig::default(),
        );

        assert!(engine.state().buffer()[0].is_finite());
        for contributions in result.outbox.values() {
            for c in contributions {
                assert!(c.value.is_finite());
            }
        }
        for v in &result.output_vector {
            assert!(v.is_finite());
        }
    }

    #[test]
    fn non_finite_activation_results_collapse_to_zero() {
        // exp(buffer^2) overflows f32 well before buffer = 10.
        let state = build_state(8, 10.0, 0.1, 0.5, ActivationFn::Gauss as u8, RESET_ZERO, &[], 1);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        let result = compute_simple(&mut engine, 1, &routing);
        assert_eq!(result.fired_count, 0);
        assert!(result.outbox.is_empty());
    }

    #[test]
    fn unknown_activation_code_activates_to_zero() {
        let state = build_state(8, 0.9, 0.1, 0.2, 200, RESET_ZERO, &[(9, 0, 0.5)], 1);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        let result = compute_simple(&mut engine, 1, &routing);
        assert_eq!(result.fired_count, 0);
        assert!(result.outbox.is_empty());
    }

    // ------------------------------------------------------------------
    // Homeostasis
    // ------------------------------------------------------------------

    #[test]
    fn homeostasis_regulates_before_the_pre_activation_gate() {
        let state = build_state(8, 0.5, 0.9, 0.2, IDENTITY, RESET_HOLD, &[(9, 0, 0.5)], 1);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        let result = engine.compute(
            10,
            &routing,
            &VizScope::disabled(),
            &PlasticityConfig::default(),
            &homeostasis_cfg(1.0, 1),
            &CostConfig::default(),
        );

        assert!(result.outbox.is_empty());
        assert_eq!(result.fired_count, 0);
        assert!(engine.state().buffer()[0] < 0.5);
    }

    #[test]
    fn homeostasis_steps_the_buffer_code_toward_zero() {
        let state = build_state(8, 0.72, 1.0, 0.2, IDENTITY, RESET_HOLD, &[], 1);
        let routing = routing_for(&state);
        let map = buffer_map();
        let before = map.encode(0.72, BUFFER_BITS) as i64;
        let target = map.encode(0.0, BUFFER_BITS) as i64;
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        let _ = engine.compute(
            11,
            &routing,
            &VizScope::disabled(),
            &PlasticityConfig::default(),
            &homeostasis_cfg(1.0, 3),
            &CostConfig::default(),
        );

        let after = map.encode(engine.state().buffer()[0], BUFFER_BITS) as i64;
        let moved = (after - before).abs();
        assert!(moved >= 1);
        assert_eq!(moved, 3.min((target - before).abs()));
    }

    #[test]
    fn homeostasis_gate_is_deterministic_for_a_fixed_seed() {
        let run = || {
            let state = build_state(
                8,
                0.63,
                1.0,
                0.2,
                IDENTITY,
                RESET_HOLD,
                &[],
                0x0706050403020100,
            );
            let routing = routing_for(&state);
            let mut engine = Engine::new(state, ShardId::new(8, 0));
            let _ = engine.compute(
                123,
                &routing,
                &VizScope::disabled(),
                &PlasticityConfig::default(),
                &homeostasis_cfg(0.35, 2),
                &CostConfig::default(),
            );
            engine.state().buffer()[0]
        };
        assert_eq!(run().to_bits(), run().to_bits());
    }

    #[test]
    fn energy_coupling_scales_the_gate_probability() {
        let seed = 0x0102030405060708u64;
        let addr = NeuronAddr::new(8, 0).raw();
        // A tick whose draw lands between base and coupled probability.
        let tick = find_tick_with_neuron_sample(seed, addr, |s| (0.2..0.4).contains(&s));

        let map = buffer_map();
        let original = map.encode(0.6, BUFFER_BITS);

        let run = |coupled: bool| {
            let state = build_state(8, 0.6, 1.0, 0.2, IDENTITY, RESET_HOLD, &[], seed);
            let routing = routing_for(&state);
            let mut engine = Engine::new(state, ShardId::new(8, 0));
            let cfg = HomeostasisConfig {
                enabled: true,
                base_probability: 0.2,
                min_step_codes: 2,
                energy: EnergyCoupling {
                    enabled: coupled,
                    target_scale: 1.0,
                    probability_scale: 2.0,
                },
                ..HomeostasisConfig::default()
            };
            let _ = engine.compute(
                tick,
                &routing,
                &VizScope::disabled(),
                &PlasticityConfig::default(),
                &cfg,
                &CostConfig::default(),
            );
            map.encode(engine.state().buffer()[0], BUFFER_BITS)
        };

        assert_eq!(run(false), original, "uncoupled draw stays above the gate");
        assert_ne!(run(true), original, "coupled gate doubles the probability");
    }

    // ------------------------------------------------------------------
    // Plasticity
    // ------------------------------------------------------------------

    #[test]
    fn plasticity_updates_strength_after_the_current_emission() {
        let state = build_state(8, 0.9, 0.1, 0.2, IDENTITY, RESET_HOLD, &[(9, 0, 0.5)], 1);
        let routing = routing_for(&state);
        let base_code = state.axons().base_code[0];
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        let result = compute_with_plasticity(
            &mut engine,
            15,
            &routing,
            &plasticity_cfg(0.25, false, 0.25),
        );

        let contributions = result.outbox.get(&ShardId::new(9, 0)).unwrap();
        assert!((contributions[0].value - 0.45).abs() < 1e-6, "pre-update strength emitted");
        assert!(result.plasticity_changes > 0);

        let axons = engine.state().axons();
        assert!((axons.strength[0] - 0.725).abs() < 1e-6);
        let expected = engine
            .state()
            .strength_quant()
            .encode(axons.strength[0], STRENGTH_BITS) as u8;
        assert_eq!(axons.runtime_code[0], expected);
        assert_eq!(axons.drifted[0], expected != base_code);
    }

    #[test]
    fn opposed_firing_shrinks_magnitude_without_flipping_sign() {
        let state = build_state(8, 0.9, 0.1, 0.2, IDENTITY, RESET_HOLD, &[(9, 0, -0.6)], 1);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        let _ = compute_with_plasticity(&mut engine, 20, &routing, &plasticity_cfg(0.5, false, 0.5));
        assert!((engine.state().axons().strength[0] + 0.15).abs() < 1e-6);
    }

    #[test]
    fn delta_not_rate_drives_the_nudge_magnitude() {
        let state = build_state(8, 0.9, 0.1, 0.2, IDENTITY, RESET_HOLD, &[(9, 0, 0.5)], 1);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        let _ = compute_with_plasticity(&mut engine, 31, &routing, &plasticity_cfg(0.01, false, 0.3));
        assert!((engine.state().axons().strength[0] - 0.77).abs() < 1e-6);
    }

    #[test]
    fn probabilistic_gate_skips_deterministically() {
        let rate = 0.2f32;
        let gate = rate * 0.9;
        let probe = build_state(8, 0.9, 0.1, 0.2, IDENTITY, RESET_HOLD, &[(9, 0, 0.5)], 1);
        let tick = find_tick_with_axon_sample(&probe, |s| s >= gate);

        let run = |probabilistic: bool| {
            let state = build_state(8, 0.9, 0.1, 0.2, IDENTITY, RESET_HOLD, &[(9, 0, 0.5)], 1);
            let routing = routing_for(&state);
            let mut engine = Engine::new(state, ShardId::new(8, 0));
            let result = compute_with_plasticity(
                &mut engine,
                tick,
                &routing,
                &plasticity_cfg(rate, probabilistic, rate),
            );
            (engine.state().axons().strength[0], result.plasticity_changes)
        };

        let (gated_strength, gated_changes) = run(true);
        let (direct_strength, direct_changes) = run(false);
        assert!((gated_strength - 0.5).abs() < 1e-6);
        assert_eq!(gated_changes, 0);
        assert!(direct_strength > 0.5);
        assert!(direct_changes > 0);
    }

    #[test]
    fn probabilistic_gate_applies_the_delta_step_when_taken() {
        let rate = 0.1f32;
        let gate = rate * 0.9;
        let probe = build_state(8, 0.9, 0.1, 0.2, IDENTITY, RESET_HOLD, &[(9, 0, 0.5)], 1);
        let tick = find_tick_with_axon_sample(&probe, |s| s < gate);

        let state = build_state(8, 0.9, 0.1, 0.2, IDENTITY, RESET_HOLD, &[(9, 0, 0.5)], 1);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));
        let _ = compute_with_plasticity(&mut engine, tick, &routing, &plasticity_cfg(rate, true, 0.3));
        assert!((engine.state().axons().strength[0] - 0.77).abs() < 1e-6);
    }

    #[test]
    fn zero_strength_acquires_the_potential_direction() {
        let state = build_state(8, 0.9, 0.1, 0.2, IDENTITY, RESET_HOLD, &[(9, 0, 0.0)], 1);
        let zero_code = state.axons().base_code[0];
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        let _ = compute_with_plasticity(&mut engine, 51, &routing, &plasticity_cfg(0.3, false, 0.2));
        assert!(engine.state().axons().strength[0] > 0.0);
        assert_ne!(engine.state().axons().runtime_code[0], zero_code);
    }

    #[test]
    fn aligned_local_target_amplifies_the_nudge() {
        let state = cadence_state(true, 0.8, 0.5);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        engine.state_mut().apply_contribution(0, 0.9);
        let _ = compute_with_plasticity(&mut engine, 61, &routing, &plasticity_cfg(0.25, false, 0.25));
        assert!(engine.state().axons().strength[0] > 0.725);
    }

    #[test]
    fn opposed_local_target_dampens_the_nudge() {
        let state = cadence_state(true, -0.8, 0.5);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        engine.state_mut().apply_contribution(0, 0.9);
        let _ = compute_with_plasticity(&mut engine, 63, &routing, &plasticity_cfg(0.25, false, 0.25));
        let strength = engine.state().axons().strength[0];
        assert!(strength >= 0.5 && strength < 0.725, "strength = {}", strength);
    }

    #[test]
    fn rebase_commits_runtime_codes_once_the_count_threshold_hits() {
        let state = build_state(8, 0.9, 0.1, 0.2, IDENTITY, RESET_HOLD, &[(9, 0, 0.5)], 1);
        let original_base = state.axons().base_code[0];
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        let cfg = PlasticityConfig {
            rebase_threshold: 1,
            ..plasticity_cfg(0.25, false, 0.25)
        };
        let _ = compute_with_plasticity(&mut engine, 41, &routing, &cfg);

        let axons = engine.state().axons();
        assert_ne!(axons.base_code[0], original_base);
        assert_eq!(axons.base_code[0], axons.runtime_code[0]);
        assert!(!axons.drifted[0]);
    }

    #[test]
    fn rebase_below_the_count_threshold_preserves_the_overlay() {
        let state = build_state(8, 0.9, 0.1, 0.2, IDENTITY, RESET_HOLD, &[(9, 0, 0.5)], 1);
        let original_base = state.axons().base_code[0];
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        let cfg = PlasticityConfig {
            rebase_threshold: 2,
            ..plasticity_cfg(0.25, false, 0.25)
        };
        let _ = compute_with_plasticity(&mut engine, 43, &routing, &cfg);

        let axons = engine.state().axons();
        assert_eq!(axons.base_code[0], original_base);
        assert_ne!(axons.base_code[0], axons.runtime_code[0]);
        assert!(axons.drifted[0]);
    }

    #[test]
    fn rebase_fraction_threshold_triggers_too() {
        let state = build_state(8, 0.9, 0.1, 0.2, IDENTITY, RESET_HOLD, &[(9, 0, 0.5)], 1);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        let cfg = PlasticityConfig {
            rebase_threshold_pct: 0.5,
            ..plasticity_cfg(0.25, false, 0.25)
        };
        let _ = compute_with_plasticity(&mut engine, 45, &routing, &cfg);

        let axons = engine.state().axons();
        assert_eq!(axons.base_code[0], axons.runtime_code[0]);
        assert!(!axons.drifted[0]);
    }

    #[test]
    fn nan_strength_normalizes_without_counting_as_plasticity() {
        let schema = QuantSchema::default();
        let zero_code = schema.strength.encode(0.0, STRENGTH_BITS) as u8;
        let mut state = build_state(8, 0.9, 0.1, 0.2, IDENTITY, RESET_HOLD, &[(9, 0, 0.0)], 1);
        state.axons.strength[0] = f32::NAN;
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        let result = compute_simple(&mut engine, 25, &routing);
        let contributions = result.outbox.get(&ShardId::new(9, 0)).unwrap();
        assert_eq!(contributions[0].value, 0.0);
        assert_eq!(result.plasticity_changes, 0);

        let axons = engine.state().axons();
        assert_eq!(axons.strength[0], 0.0);
        assert_eq!(axons.runtime_code[0], zero_code);
        assert!(!axons.drifted[0]);
    }

    // ------------------------------------------------------------------
    // Cost model
    // ------------------------------------------------------------------

    #[test]
    fn disabled_energy_accounting_reports_all_zero_components() {
        let state = build_state(8, 0.9, 0.1, 0.2, IDENTITY, RESET_HOLD, &[(9, 0, 0.5)], 1);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        let cfg = CostConfig {
            energy_enabled: false,
            remote_cost_enabled: true,
            remote_cost_per_batch: 5,
            remote_cost_per_contribution: 2,
            ..CostConfig::default()
        };
        let result = engine.compute(
            1,
            &routing,
            &VizScope::disabled(),
            &PlasticityConfig::default(),
            &HomeostasisConfig::default(),
            &cfg,
        );

        assert_eq!(result.cost, CostBreakdown::default());
        assert_eq!(result.cost.total(), 0);
    }

    #[test]
    fn enabled_energy_accounting_charges_every_stage() {
        let state = build_state(8, 0.9, 0.1, 0.2, IDENTITY, RESET_HOLD, &[(9, 0, 0.5)], 1);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));

        let cfg = CostConfig {
            energy_enabled: true,
            remote_cost_enabled: true,
            remote_cost_per_batch: 5,
            remote_cost_per_contribution: 2,
            ..CostConfig::default()
        };
        let result = engine.compute(
            1,
            &routing,
            &VizScope::disabled(),
            &PlasticityConfig::default(),
            &HomeostasisConfig::default(),
            &cfg,
        );

        assert!(result.cost.accum > 0);
        assert!(result.cost.activation > 0);
        assert!(result.cost.reset > 0);
        assert!(result.cost.distance > 0);
        assert_eq!(result.cost.remote, 5 + 2, "one remote batch, one contribution");
        assert_eq!(result.cost.total(), engine.last_tick_cost());
    }

    #[test]
    fn tier_multipliers_weight_expensive_functions_higher() {
        let cfg = CostConfig {
            energy_enabled: true,
            tier_c_multiplier: 2.0,
            ..CostConfig::default()
        };

        let run = |activation: u8, reset_code: u8| {
            let state = build_state(8, 0.9, 0.1, 0.2, activation, reset_code, &[], 1);
            let routing = routing_for(&state);
            let mut engine = Engine::new(state, ShardId::new(8, 0));
            engine
                .compute(
                    5,
                    &routing,
                    &VizScope::disabled(),
                    &PlasticityConfig::default(),
                    &HomeostasisConfig::default(),
                    &cfg,
                )
                .cost
        };

        let baseline = run(IDENTITY, RESET_HOLD);
        let expensive = run(
            ActivationFn::Quad as u8,
            reset_combo_code(ResetBase::InversePotential, 3, ResetClamp::FireThreshold),
        );

        assert!(expensive.activation > baseline.activation);
        assert!(expensive.reset > baseline.reset);
        assert!(expensive.total() > baseline.total());
    }

    #[test]
    fn remote_cost_charges_only_off_shard_batches() {
        let axons = [(8u8, 0u32, 0.5f32), (9, 0, 0.5), (9, 1, 0.5)];
        let run = |remote_enabled: bool| {
            let state = build_state(8, 0.9, 0.1, 0.2, IDENTITY, RESET_HOLD, &axons, 1);
            let routing = routing_for(&state);
            let mut engine = Engine::new(state, ShardId::new(8, 0));
            engine.compute(
                7,
                &routing,
                &VizScope::disabled(),
                &PlasticityConfig::default(),
                &HomeostasisConfig::default(),
                &CostConfig {
                    energy_enabled: true,
                    remote_cost_enabled: remote_enabled,
                    remote_cost_per_batch: 5,
                    remote_cost_per_contribution: 2,
                    ..CostConfig::default()
                },
            )
        };

        let enabled = run(true);
        let disabled = run(false);

        assert!(enabled.outbox.contains_key(&ShardId::new(8, 0)));
        assert_eq!(enabled.outbox.get(&ShardId::new(9, 0)).unwrap().len(), 2);
        assert_eq!(enabled.cost.remote, 5 + 2 * 2);
        assert_eq!(disabled.cost.remote, 0);
        assert_eq!(enabled.cost.total() - 9, disabled.cost.total());
    }

    // ------------------------------------------------------------------
    // Output region & visualization
    // ------------------------------------------------------------------

    #[test]
    fn output_region_records_vector_and_events() {
        let state = build_state(31, 0.9, 0.1, 0.2, IDENTITY, RESET_ZERO, &[], 1);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(31, 0));

        let result = compute_simple(&mut engine, 3, &routing);
        assert_eq!(result.output_vector, vec![0.9]);
        assert_eq!(result.output_events.len(), 1);
        assert_eq!(result.output_events[0].output_index, 0);
        assert!((result.output_events[0].value - 0.9).abs() < 1e-6);
    }

    #[test]
    fn output_vector_records_gated_potentials_too() {
        // Fires nothing (potential below threshold) but the vector still
        // carries the potential.
        let state = build_state(31, 0.3, 0.1, 0.5, IDENTITY, RESET_ZERO, &[], 1);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(31, 0));

        let result = compute_simple(&mut engine, 3, &routing);
        assert_eq!(result.output_vector, vec![0.3]);
        assert!(result.output_events.is_empty());
    }

    #[test]
    fn buffer_samples_emit_only_on_movement() {
        let state = build_state(8, 0.9, 0.1, 0.2, IDENTITY, RESET_HOLD, &[], 1);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));
        let viz = VizScope {
            enabled: true,
            focus_region: None,
        };
        let idle = (
            PlasticityConfig::default(),
            HomeostasisConfig::default(),
            CostConfig::default(),
        );

        let first = engine.compute(1, &routing, &viz, &idle.0, &idle.1, &idle.2);
        assert_eq!(first.buffer_events.len(), 1, "first sample always emits");

        let second = engine.compute(2, &routing, &viz, &idle.0, &idle.1, &idle.2);
        assert_eq!(second.buffer_events.len(), 1, "reset moved the buffer");

        let third = engine.compute(3, &routing, &viz, &idle.0, &idle.1, &idle.2);
        assert!(third.buffer_events.is_empty(), "no movement, no sample");
    }

    #[test]
    fn focus_region_filters_neuron_diagnostics() {
        let state = build_state(8, 0.9, 0.1, 0.2, IDENTITY, RESET_HOLD, &[(9, 0, 0.5)], 1);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));
        let viz = VizScope {
            enabled: true,
            focus_region: Some(12),
        };

        let result = engine.compute(
            1,
            &routing,
            &viz,
            &PlasticityConfig::default(),
            &HomeostasisConfig::default(),
            &CostConfig::default(),
        );
        assert!(result.buffer_events.is_empty());
        assert!(result.fired_events.is_empty());
        assert!(result.route_events.is_empty());
    }

    #[test]
    fn route_activity_reports_equal_weight_running_means() {
        let state = build_state(8, 0.9, 0.1, 0.2, IDENTITY, RESET_HOLD, &[(9, 0, 0.5)], 1);
        let routing = routing_for(&state);
        let mut engine = Engine::new(state, ShardId::new(8, 0));
        let viz = VizScope {
            enabled: true,
            focus_region: None,
        };
        let idle = (
            PlasticityConfig::default(),
            HomeostasisConfig::default(),
            CostConfig::default(),
        );

        let first = engine.compute(1, &routing, &viz, &idle.0, &idle.1, &idle.2);
        assert_eq!(first.route_events.len(), 1);
        assert!((first.route_events[0].mean_value - 0.45).abs() < 1e-6);

        // Buffer held at 0.2 by the reset; top it back up to 0.8.
        engine.state_mut().apply_contribution(0, 0.6);
        let second = engine.compute(2, &routing, &viz, &idle.0, &idle.1, &idle.2);
        assert_eq!(second.route_events.len(), 1);
        let mean = second.route_events[0].mean_value;
        assert!(((0.45 + 0.4) / 2.0 - mean).abs() < 1e-6, "mean = {}", mean);
    }

    // ------------------------------------------------------------------
    // Function tables
    // ------------------------------------------------------------------

    #[test]
    fn activation_table_spot_checks() {
        use ActivationFn::*;
        assert_eq!(activate(Identity, 0.4, 0.0, 0.0), 0.4);
        assert_eq!(activate(StepUp, -0.1, 0.0, 0.0), 0.0);
        assert_eq!(activate(StepMid, -0.1, 0.0, 0.0), -1.0);
        assert_eq!(activate(Relu, -3.0, 0.0, 0.0), 0.0);
        assert_eq!(activate(NegRelu, 3.0, 0.0, 0.0), 0.0);
        assert!((activate(Elu, -1.0, 0.5, 0.0) - 0.5 * ((-1.0f32).exp() - 1.0)).abs() < 1e-6);
        assert!((activate(Selu, 2.0, 0.0, 1.5) - 3.0).abs() < 1e-6);
        assert_eq!(activate(RangeClamp, 0.7, 1.0, 0.5), 0.0, "empty range");
        assert_eq!(activate(RangeClamp, 0.7, -0.5, 0.5), 0.5);
        assert_eq!(activate(ModLeft, 5.0, 0.0, 0.0), 0.0, "modulo by zero");
        assert!((activate(ModLeft, 5.0, 3.0, 0.0) - 2.0).abs() < 1e-6);
        assert_eq!(activate(ModRight, 0.0, 3.0, 0.0), 0.0);
        assert_eq!(activate(Log, -1.0, 0.0, 0.0), 0.0, "ln of negative sanitizes");
        assert_eq!(activate(Log, 0.0, 0.0, 0.0), 0.0);
        assert!((activate(Gauss, 1.0, 0.0, 0.0) - 1.0f32.exp()).abs() < 1e-5);
        assert!((activate(Quad, 2.0, 1.5, -1.0) - 4.0).abs() < 1e-6);
        assert_eq!(activate(ActivationFn::None, 9.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn reset_combinator_spot_checks() {
        // Half the potential, clamped to the unit range.
        let half_pot_unit = reset_combo_code(ResetBase::Potential, 2, ResetClamp::Unit);
        assert!((reset(half_pot_unit, 9.0, 4.0, 0.5, 1) - 1.0).abs() < 1e-6);

        // Negative potential clamped by the buffer magnitude.
        let neg_pot = reset_combo_code(ResetBase::NegPotential, 3, ResetClamp::BufferMagnitude);
        assert!((reset(neg_pot, 0.3, 2.0, 0.5, 1) + 0.3).abs() < 1e-6);

        // Inverse potential: 1/0 collapses to 0.
        let inverse = reset_combo_code(ResetBase::InversePotential, 3, ResetClamp::FireThreshold);
        assert_eq!(reset(inverse, 0.9, 0.0, 0.5, 1), 0.0);
        assert!((reset(inverse, 0.9, 4.0, 0.5, 1) - 0.25).abs() < 1e-6);

        assert_eq!(reset(RESET_ZERO, 0.9, 1.0, 0.5, 1), 0.0);
        assert!((reset(RESET_HOLD, 0.9, 1.0, 0.5, 1) - 0.5).abs() < 1e-6);
        assert!((reset(RESET_DIVIDE_AXON_COUNT, 0.8, 1.0, 0.5, 4) - 0.2).abs() < 1e-6);
        assert_eq!(reset(RESET_DIVIDE_AXON_COUNT, 0.8, 1.0, 2.0, 0), 0.8, "degree floors at 1");

        // Unknown codes leave the buffer unchanged.
        assert_eq!(reset(250, 0.33, 1.0, 0.5, 1), 0.33);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn config_bundles_round_trip_through_json() {
        let plasticity = PlasticityConfig {
            enabled: true,
            rate: 0.2,
            probabilistic: true,
            delta: 0.14,
            rebase_threshold: 8,
            rebase_threshold_pct: 0.25,
        };
        let json = serde_json::to_string(&plasticity).unwrap();
        assert_eq!(serde_json::from_str::<PlasticityConfig>(&json).unwrap(), plasticity);

        let homeostasis = homeostasis_cfg(0.4, 3);
        let json = serde_json::to_string(&homeostasis).unwrap();
        assert_eq!(
            serde_json::from_str::<HomeostasisConfig>(&json).unwrap(),
            homeostasis
        );
    }
}

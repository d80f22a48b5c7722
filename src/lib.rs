//! # neuromesh
//!
//! Single-shard simulation core for a very large spiking-neuron network
//! partitioned into 32 fixed regions, each split into independently
//! schedulable shards.
//!
//! A shard owns flat parallel arrays of neuron state plus a flat axon table,
//! advances them one discrete tick at a time, and exchanges contributions
//! with peer shards through per-destination outboxes. Every stored scalar is
//! a quantized integer code; the codec stays live at runtime because
//! plasticity re-encodes drifted axon strengths and homeostasis steps
//! buffers through code space.
//!
//! ## Quick start
//!
//! ```
//! use neuromesh::prelude::*;
//!
//! // One neuron in region 8, firing through one axon into region 9.
//! let schema = QuantSchema::default();
//! let mut region_spans = [0u32; REGION_COUNT];
//! region_spans[8] = 1;
//! region_spans[9] = 1;
//!
//! let code = schema.strength.encode(0.5, 5) as u8;
//! let axons = AxonTable {
//!     target_region: vec![9],
//!     target_neuron: vec![0],
//!     strength: vec![0.5],
//!     base_code: vec![code],
//!     runtime_code: vec![code],
//!     drifted: vec![false],
//!     from_addr: vec![NeuronAddr::new(8, 0).raw()],
//!     to_addr: vec![NeuronAddr::new(9, 0).raw()],
//! };
//!
//! let state = ShardState::new(ShardInit {
//!     region_id: 8,
//!     neuron_start: 0,
//!     brain_seed: 42,
//!     strength_quant: schema.strength,
//!     strength_bits: 5,
//!     region_spans,
//!     buffer: vec![0.0],
//!     enabled: vec![true],
//!     exists: vec![true],
//!     accum_fn: vec![AccumFn::SUM],
//!     activation_fn: vec![ActivationFn::Identity as u8],
//!     reset_fn: vec![RESET_ZERO],
//!     param_a: vec![0.0],
//!     param_b: vec![0.0],
//!     pre_threshold: vec![0.0],
//!     fire_threshold: vec![0.5],
//!     axon_count: vec![1],
//!     axon_start: vec![0],
//!     axons,
//! });
//!
//! let routing = RoutingTable::single_shard(state.region_spans());
//! let mut engine = Engine::new(state, ShardId::new(8, 0));
//!
//! engine.state_mut().apply_contribution(0, 1.0);
//! let result = engine.compute(
//!     1,
//!     &routing,
//!     &VizScope::disabled(),
//!     &PlasticityConfig::default(),
//!     &HomeostasisConfig::default(),
//!     &CostConfig::default(),
//! );
//! assert_eq!(result.fired_count, 1);
//! ```
//!
//! ## Modules
//!
//! - [`quant`]: quantized scalar codec and the default artifact schema
//! - [`address`]: packed neuron/shard identities and region layout
//! - [`rng`]: deterministic draw mixing for homeostasis and plasticity
//! - [`state`]: per-shard neuron arrays, axon table and inbox
//! - [`routing`]: (region, neuron) → shard span lookup
//! - [`engine`]: the per-tick compute algorithm

#[path = "core/address.rs"]
pub mod address;

#[path = "core/quant.rs"]
pub mod quant;

#[path = "core/rng.rs"]
pub mod rng;

#[path = "core/state.rs"]
pub mod state;

#[path = "core/routing.rs"]
pub mod routing;

#[path = "core/engine.rs"]
pub mod engine;

/// Prelude module for convenient imports.
///
/// ```
/// use neuromesh::prelude::*;
/// ```
pub mod prelude {
    pub use crate::address::{
        region_z, NeuronAddr, ShardId, INPUT_REGION, MAX_AXONS_PER_NEURON, MAX_NEURON_ID,
        OUTPUT_REGION, REGION_COUNT,
    };
    pub use crate::engine::{
        activate, reset, reset_combo_code, ActivationFn, ComputeResult, Contribution,
        CostBreakdown, CostConfig, EnergyCoupling, Engine, HomeostasisConfig, HomeostasisTarget,
        HomeostasisUpdate, NeuronFired, NeuronSample, OutputEvent, PlasticityConfig, ResetBase,
        ResetClamp, RouteActivity, VizScope, RESET_CLAMP_POTENTIAL, RESET_DIVIDE_AXON_COUNT,
        RESET_HOLD, RESET_SCALES, RESET_ZERO,
    };
    pub use crate::quant::{buffer_map, QuantMap, QuantSchema, QuantShape, BUFFER_BITS};
    pub use crate::rng::{mix_seed, unit_interval};
    pub use crate::routing::{PlanSpan, RoutingTable, ShardSpan};
    pub use crate::state::{AccumFn, AxonTable, ShardInit, ShardState};
}

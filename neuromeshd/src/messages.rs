//! Wire contract of a shard.
//!
//! Payload structs are plain serde-serializable data (ids, counts, floats)
//! so any transport can carry them. The [`ShardMsg`] envelope and
//! [`Endpoint`] senders are in-process plumbing only: the delivery substrate
//! between workers is deliberately out of scope here.

use neuromesh::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

pub type BrainId = u64;

/// Contributions from a peer shard, addressed to this shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalBatch {
    pub brain_id: BrainId,
    pub region_id: u8,
    /// Absent in single-shard deployments where the region id suffices.
    pub shard: Option<ShardId>,
    pub tick_id: u64,
    pub contributions: Vec<Contribution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalBatchAck {
    pub brain_id: BrainId,
    pub region_id: u8,
    pub shard: ShardId,
    pub tick_id: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TickCompute {
    pub tick_id: u64,
}

/// One tick's contributions for a single destination shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxBatch {
    pub brain_id: BrainId,
    pub tick_id: u64,
    pub dest_region: u8,
    pub dest_shard: ShardId,
    pub contributions: Vec<Contribution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickComputeDone {
    pub tick_id: u64,
    pub region_id: u8,
    pub shard: ShardId,
    pub compute_ms: u64,
    pub cost_total: i64,
    pub cost_accum: i64,
    pub cost_activation: i64,
    pub cost_reset: i64,
    pub cost_distance: i64,
    pub cost_remote: i64,
    pub fired_count: u32,
    pub out_batches: u32,
    pub out_contribs: u32,
}

/// A firing neuron in the output region.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OutputSignal {
    pub brain_id: BrainId,
    pub tick_id: u64,
    pub output_index: u32,
    pub value: f32,
}

/// Dense per-tick potentials of this shard's slice of the output region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputVectorSegment {
    pub brain_id: BrainId,
    pub tick_id: u64,
    pub output_index_start: u32,
    pub values: Vec<f32>,
}

/// Live reconfiguration of the simulation bundles, no restart required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfigUpdate {
    pub brain_id: BrainId,
    pub region_id: u8,
    pub shard_index: u16,
    pub plasticity: PlasticityConfig,
    pub homeostasis: HomeostasisConfig,
    pub cost: CostConfig,
    pub viz: VizScope,
}

/// One drifted axon in a snapshot: its runtime strength code overlays the
/// artifact's base code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayRecord {
    pub from_addr: u32,
    pub to_addr: u32,
    pub strength_code: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSnapshot {
    pub region_id: u8,
    pub shard: ShardId,
    pub neuron_start: u32,
    pub neuron_count: u32,
    /// Buffers encoded under the buffer map at [`BUFFER_BITS`].
    pub buffer_codes: Vec<u32>,
    pub enabled_bitset: Vec<u8>,
    pub overlays: Vec<OverlayRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum SnapshotError {
    #[error("brain id mismatch")]
    BrainIdMismatch,
    #[error("shard id mismatch")]
    ShardIdMismatch,
}

/// Messages a shard forwards to its peers (router, sinks, ack targets).
#[derive(Debug, Clone)]
pub enum PeerMsg {
    Outbox(OutboxBatch),
    Ack(SignalBatchAck),
    Done(TickComputeDone),
    Output(OutputSignal),
    OutputVector(OutputVectorSegment),
}

/// A peer capable of receiving shard traffic. Sends are fire-and-forget;
/// a dropped peer is ignored, never retried.
pub type Endpoint = mpsc::UnboundedSender<PeerMsg>;

/// The shard actor's mailbox protocol.
#[derive(Debug)]
pub enum ShardMsg {
    UpdateEndpoints {
        router: Option<Endpoint>,
        output_sink: Option<Endpoint>,
        tick_sink: Option<Endpoint>,
    },
    UpdateRouting(RoutingTable),
    UpdateRuntimeConfig(RuntimeConfigUpdate),
    Signal {
        batch: SignalBatch,
        reply: Option<Endpoint>,
    },
    Tick {
        tick: TickCompute,
        reply: Option<Endpoint>,
    },
    /// Externally injected contribution (the IO gateway's input path).
    Pulse {
        brain_id: BrainId,
        region_id: u8,
        neuron_id: u32,
        value: f32,
    },
    /// Direct neuron state write used by debug tooling.
    WriteNeuronState {
        brain_id: BrainId,
        region_id: u8,
        neuron_id: u32,
        buffer: Option<f32>,
        accumulator: Option<f32>,
    },
    CaptureSnapshot {
        brain_id: BrainId,
        region_id: u8,
        shard_index: u16,
        reply: oneshot::Sender<Result<ShardSnapshot, SnapshotError>>,
    },
}

//! The shard actor: a sequential message loop around one compute engine.
//!
//! One mailbox per shard, processed strictly in arrival order, so the engine
//! never sees concurrent mutation and needs no locks. Shards interact only
//! through messages; all sends are fire-and-forget. The asynchronous inbox
//! (filled by `Signal`, drained by `Tick`) decouples unordered cross-shard
//! arrival from the deterministic per-neuron compute pass.

use std::time::Instant;

use neuromesh::prelude::*;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::messages::{
    BrainId, Endpoint, OutboxBatch, OutputSignal, OutputVectorSegment, OverlayRecord, PeerMsg,
    RuntimeConfigUpdate, ShardMsg, ShardSnapshot, SignalBatch, SignalBatchAck, SnapshotError,
    TickCompute, TickComputeDone,
};

/// Completions kept for duplicate-tick replay.
const RECENT_DONE_CAP: usize = 2;

/// Simulation bundles applied on every tick; replaceable live via
/// [`ShardMsg::UpdateRuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeSettings {
    pub plasticity: PlasticityConfig,
    pub homeostasis: HomeostasisConfig,
    pub cost: CostConfig,
    pub viz: VizScope,
}

#[derive(Debug)]
pub struct ShardConfig {
    pub brain_id: BrainId,
    pub shard: ShardId,
    pub routing: RoutingTable,
    pub router: Option<Endpoint>,
    pub output_sink: Option<Endpoint>,
    pub tick_sink: Option<Endpoint>,
    pub runtime: RuntimeSettings,
}

pub struct ShardActor {
    engine: Engine,
    brain_id: BrainId,
    routing: RoutingTable,
    router: Option<Endpoint>,
    output_sink: Option<Endpoint>,
    tick_sink: Option<Endpoint>,
    runtime: RuntimeSettings,
    recent_done: Vec<TickComputeDone>,
    has_computed: bool,
    last_tick: u64,
}

/// Spawn a shard actor onto the runtime and return its mailbox.
pub fn spawn(state: ShardState, config: ShardConfig) -> mpsc::UnboundedSender<ShardMsg> {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = ShardActor::new(state, config);
    tokio::spawn(actor.run(rx));
    tx
}

impl ShardActor {
    pub fn new(state: ShardState, config: ShardConfig) -> Self {
        Self {
            engine: Engine::new(state, config.shard),
            brain_id: config.brain_id,
            routing: config.routing,
            router: config.router,
            output_sink: config.output_sink,
            tick_sink: config.tick_sink,
            runtime: config.runtime,
            recent_done: Vec::with_capacity(RECENT_DONE_CAP),
            has_computed: false,
            last_tick: 0,
        }
    }

    pub async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<ShardMsg>) {
        info!(shard = %self.engine.shard_id(), brain = self.brain_id, "shard started");
        while let Some(message) = mailbox.recv().await {
            self.handle(message);
        }
        debug!(shard = %self.engine.shard_id(), "shard mailbox closed");
    }

    fn handle(&mut self, message: ShardMsg) {
        match message {
            ShardMsg::UpdateEndpoints {
                router,
                output_sink,
                tick_sink,
            } => {
                self.router = router;
                self.output_sink = output_sink;
                self.tick_sink = tick_sink;
                debug!(shard = %self.engine.shard_id(), "endpoints updated");
            }
            ShardMsg::UpdateRouting(routing) => {
                self.routing = routing;
                debug!(shard = %self.engine.shard_id(), "routing table updated");
            }
            ShardMsg::UpdateRuntimeConfig(update) => self.handle_runtime_config(update),
            ShardMsg::Signal { batch, reply } => self.handle_signal(batch, reply),
            ShardMsg::Tick { tick, reply } => self.handle_tick(tick, reply),
            ShardMsg::Pulse {
                brain_id,
                region_id,
                neuron_id,
                value,
            } => {
                if brain_id == self.brain_id && region_id == self.engine.state().region_id() {
                    self.engine.state_mut().apply_runtime_pulse(neuron_id, value);
                }
            }
            ShardMsg::WriteNeuronState {
                brain_id,
                region_id,
                neuron_id,
                buffer,
                accumulator,
            } => {
                if brain_id == self.brain_id && region_id == self.engine.state().region_id() {
                    self.engine
                        .state_mut()
                        .set_runtime_state(neuron_id, buffer, accumulator);
                }
            }
            ShardMsg::CaptureSnapshot {
                brain_id,
                region_id,
                shard_index,
                reply,
            } => {
                let _ = reply.send(self.capture_snapshot(brain_id, region_id, shard_index));
            }
        }
    }

    fn handle_runtime_config(&mut self, update: RuntimeConfigUpdate) {
        if update.brain_id != self.brain_id
            || update.region_id != self.engine.state().region_id()
            || update.shard_index != self.engine.shard_id().shard_index()
        {
            return;
        }
        self.runtime = RuntimeSettings {
            plasticity: update.plasticity,
            homeostasis: update.homeostasis,
            cost: update.cost,
            viz: update.viz,
        };
        debug!(shard = %self.engine.shard_id(), "runtime config updated");
    }

    fn handle_signal(&mut self, batch: SignalBatch, reply: Option<Endpoint>) {
        if !self.batch_matches(&batch) {
            warn!(
                shard = %self.engine.shard_id(),
                tick = batch.tick_id,
                "rejected misaddressed signal batch"
            );
        } else if self.has_computed && batch.tick_id < self.last_tick {
            warn!(
                shard = %self.engine.shard_id(),
                tick = batch.tick_id,
                last_compute = self.last_tick,
                "dropped late signal batch"
            );
        } else {
            let state = self.engine.state_mut();
            for contribution in &batch.contributions {
                state.apply_contribution(contribution.target_neuron_id, contribution.value);
            }
        }

        let ack = SignalBatchAck {
            brain_id: self.brain_id,
            region_id: self.engine.state().region_id(),
            shard: self.engine.shard_id(),
            tick_id: batch.tick_id,
        };
        if let Some(target) = reply.as_ref().or(self.router.as_ref()) {
            let _ = target.send(PeerMsg::Ack(ack));
        }
    }

    fn handle_tick(&mut self, tick: TickCompute, reply: Option<Endpoint>) {
        if let Some(done) = self
            .recent_done
            .iter()
            .find(|done| done.tick_id == tick.tick_id)
            .copied()
        {
            debug!(shard = %self.engine.shard_id(), tick = tick.tick_id, "duplicate tick, replaying completion");
            self.send_done(done, reply.as_ref());
            return;
        }

        if self.has_computed && tick.tick_id < self.last_tick {
            warn!(
                shard = %self.engine.shard_id(),
                tick = tick.tick_id,
                last_compute = self.last_tick,
                "dropped out-of-order tick"
            );
            return;
        }

        if self.has_computed && tick.tick_id > self.last_tick + 1 {
            warn!(
                shard = %self.engine.shard_id(),
                tick = tick.tick_id,
                last_compute = self.last_tick,
                "tick id jumped forward"
            );
        }

        let started = Instant::now();
        let result = self.engine.compute(
            tick.tick_id,
            &self.routing,
            &self.runtime.viz,
            &self.runtime.plasticity,
            &self.runtime.homeostasis,
            &self.runtime.cost,
        );
        let compute_ms = started.elapsed().as_millis() as u64;

        if result.plasticity_changes > 0 {
            debug!(
                shard = %self.engine.shard_id(),
                tick = tick.tick_id,
                changes = result.plasticity_changes,
                "plasticity drifted strength codes"
            );
        }

        let out_batches = result
            .outbox
            .values()
            .filter(|contributions| !contributions.is_empty())
            .count() as u32;

        if let Some(target) = self.router.as_ref().or(reply.as_ref()) {
            // Deterministic forwarding order keeps replays comparable.
            let mut batches: Vec<(ShardId, Vec<Contribution>)> =
                result.outbox.iter().map(|(k, v)| (*k, v.clone())).collect();
            batches.sort_by_key(|(shard, _)| shard.raw());
            for (dest_shard, contributions) in batches {
                if contributions.is_empty() {
                    continue;
                }
                let _ = target.send(PeerMsg::Outbox(OutboxBatch {
                    brain_id: self.brain_id,
                    tick_id: tick.tick_id,
                    dest_region: dest_shard.region(),
                    dest_shard,
                    contributions,
                }));
            }
        }

        if let Some(sink) = self.output_sink.as_ref() {
            for event in &result.output_events {
                let _ = sink.send(PeerMsg::Output(OutputSignal {
                    brain_id: self.brain_id,
                    tick_id: event.tick_id,
                    output_index: event.output_index,
                    value: event.value,
                }));
            }
            if !result.output_vector.is_empty() {
                let _ = sink.send(PeerMsg::OutputVector(OutputVectorSegment {
                    brain_id: self.brain_id,
                    tick_id: tick.tick_id,
                    output_index_start: self.engine.state().neuron_start(),
                    values: result.output_vector.clone(),
                }));
            }
        }

        let done = TickComputeDone {
            tick_id: tick.tick_id,
            region_id: self.engine.state().region_id(),
            shard: self.engine.shard_id(),
            compute_ms,
            cost_total: result.cost.total(),
            cost_accum: result.cost.accum,
            cost_activation: result.cost.activation,
            cost_reset: result.cost.reset,
            cost_distance: result.cost.distance,
            cost_remote: result.cost.remote,
            fired_count: result.fired_count,
            out_batches,
            out_contribs: result.out_contribs,
        };

        self.has_computed = true;
        self.last_tick = tick.tick_id;
        self.cache_done(done);
        self.send_done(done, reply.as_ref());
    }

    fn batch_matches(&self, batch: &SignalBatch) -> bool {
        batch.brain_id == self.brain_id
            && batch.region_id == self.engine.state().region_id()
            && batch
                .shard
                .map_or(true, |shard| shard == self.engine.shard_id())
    }

    fn cache_done(&mut self, done: TickComputeDone) {
        self.recent_done.retain(|cached| cached.tick_id != done.tick_id);
        self.recent_done.push(done);
        while self.recent_done.len() > RECENT_DONE_CAP {
            let oldest = self
                .recent_done
                .iter()
                .enumerate()
                .min_by_key(|(_, cached)| cached.tick_id)
                .map(|(index, _)| index)
                .unwrap_or(0);
            self.recent_done.remove(oldest);
        }
    }

    fn send_done(&self, done: TickComputeDone, reply: Option<&Endpoint>) {
        let target = self
            .tick_sink
            .as_ref()
            .or(reply)
            .or(self.router.as_ref());
        if let Some(target) = target {
            let _ = target.send(PeerMsg::Done(done));
        }
    }

    fn capture_snapshot(
        &self,
        brain_id: BrainId,
        region_id: u8,
        shard_index: u16,
    ) -> Result<ShardSnapshot, SnapshotError> {
        if brain_id != self.brain_id {
            return Err(SnapshotError::BrainIdMismatch);
        }
        if region_id != self.engine.state().region_id()
            || shard_index != self.engine.shard_id().shard_index()
        {
            return Err(SnapshotError::ShardIdMismatch);
        }

        let state = self.engine.state();
        let map = buffer_map();
        let n = state.neuron_count();
        let mut buffer_codes = Vec::with_capacity(n);
        let mut enabled_bitset = vec![0u8; n.div_ceil(8)];
        for i in 0..n {
            let mut value = state.buffer()[i];
            if !value.is_finite() {
                value = 0.0;
            }
            buffer_codes.push(map.encode(value, BUFFER_BITS));
            if state.enabled()[i] {
                enabled_bitset[i / 8] |= 1 << (i % 8);
            }
        }

        let axons = state.axons();
        let mut overlays = Vec::new();
        for i in 0..axons.len() {
            if axons.drifted[i] && axons.runtime_code[i] != axons.base_code[i] {
                overlays.push(OverlayRecord {
                    from_addr: axons.from_addr[i],
                    to_addr: axons.to_addr[i],
                    strength_code: axons.runtime_code[i],
                });
            }
        }

        Ok(ShardSnapshot {
            region_id: state.region_id(),
            shard: self.engine.shard_id(),
            neuron_start: state.neuron_start(),
            neuron_count: n as u32,
            buffer_codes,
            enabled_bitset,
            overlays,
        })
    }
}

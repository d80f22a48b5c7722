//! neuromesh daemon - single-process shard host
//!
//! Stands up one shard of a synthetic ring brain and drives it:
//! - a tick driver at the configured rate
//! - a loopback router task that reflects outbox batches back as signal
//!   batches (the cluster transport is an external concern)
//! - an output sink and tick sink that log what the shard produces
//!
//! Pass a JSON config path as the first argument to override the defaults.

use std::time::Duration;

use neuromesh::prelude::*;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod messages;
mod shard;

use messages::{PeerMsg, ShardMsg, SignalBatch, TickCompute};
use shard::{RuntimeSettings, ShardConfig};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct HostConfig {
    neuron_count: u32,
    tick_hz: u32,
    brain_seed: u64,
    /// Inject a pulse into neuron 0 every this many ticks.
    pulse_every: u64,
    pulse_value: f32,
    /// Axon strength around the ring; the wave dies out as it decays.
    ring_strength: f32,
    plasticity: PlasticityConfig,
    homeostasis: HomeostasisConfig,
    cost: CostConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            neuron_count: 256,
            tick_hz: 20,
            brain_seed: 0x6d65736855af01,
            pulse_every: 16,
            pulse_value: 1.0,
            ring_strength: 0.9,
            plasticity: PlasticityConfig::default(),
            homeostasis: HomeostasisConfig::default(),
            cost: CostConfig {
                energy_enabled: true,
                ..CostConfig::default()
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum HostError {
    #[error("could not read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

fn load_config() -> Result<HostConfig, HostError> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(HostConfig::default());
    };
    let text = std::fs::read_to_string(&path).map_err(|source| HostError::Read {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| HostError::Parse { path, source })
}

/// Ring-connected shard in the output region: neuron i fires into
/// neuron (i + 1) % n, so a single pulse travels until it decays below the
/// firing threshold.
fn ring_state(config: &HostConfig) -> ShardState {
    let n = config.neuron_count.max(2);
    let schema = QuantSchema::default();
    let mut region_spans = [0u32; REGION_COUNT];
    region_spans[OUTPUT_REGION as usize] = n;

    let strength = config
        .ring_strength
        .clamp(schema.strength.min, schema.strength.max);
    let code = schema.strength.encode(strength, 5) as u8;
    let mut axons = AxonTable::default();
    for i in 0..n {
        let target = (i + 1) % n;
        axons.target_region.push(OUTPUT_REGION);
        axons.target_neuron.push(target);
        axons.strength.push(strength);
        axons.base_code.push(code);
        axons.runtime_code.push(code);
        axons.drifted.push(false);
        axons.from_addr.push(NeuronAddr::new(OUTPUT_REGION, i).raw());
        axons.to_addr.push(NeuronAddr::new(OUTPUT_REGION, target).raw());
    }

    let count = n as usize;
    ShardState::new(ShardInit {
        region_id: OUTPUT_REGION,
        neuron_start: 0,
        brain_seed: config.brain_seed,
        strength_quant: schema.strength,
        strength_bits: 5,
        region_spans,
        buffer: vec![0.0; count],
        enabled: vec![true; count],
        exists: vec![true; count],
        accum_fn: vec![AccumFn::SUM; count],
        activation_fn: vec![ActivationFn::Identity as u8; count],
        reset_fn: vec![RESET_ZERO; count],
        param_a: vec![0.0; count],
        param_b: vec![0.0; count],
        pre_threshold: vec![0.05; count],
        fire_threshold: vec![0.1; count],
        axon_count: vec![1; count],
        axon_start: (0..n).collect(),
        axons,
    })
}

const BRAIN_ID: messages::BrainId = 1;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = load_config()?;
    info!(
        neurons = config.neuron_count,
        tick_hz = config.tick_hz,
        "neuromesh daemon starting"
    );

    let state = ring_state(&config);
    let routing = RoutingTable::single_shard(state.region_spans());
    let shard_id = ShardId::new(OUTPUT_REGION, 0);

    let (router_tx, mut router_rx) = mpsc::unbounded_channel();
    let (output_tx, mut output_rx) = mpsc::unbounded_channel();
    let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();

    let shard_tx = shard::spawn(
        state,
        ShardConfig {
            brain_id: BRAIN_ID,
            shard: shard_id,
            routing,
            router: Some(router_tx),
            output_sink: Some(output_tx),
            tick_sink: Some(tick_tx),
            runtime: RuntimeSettings {
                plasticity: config.plasticity,
                homeostasis: config.homeostasis,
                cost: config.cost,
                viz: VizScope::disabled(),
            },
        },
    );

    // Loopback router: outbox batches come straight back as signal batches.
    {
        let shard_tx = shard_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = router_rx.recv().await {
                match message {
                    PeerMsg::Outbox(batch) => {
                        let send = shard_tx.send(ShardMsg::Signal {
                            batch: SignalBatch {
                                brain_id: batch.brain_id,
                                region_id: batch.dest_region,
                                shard: Some(batch.dest_shard),
                                tick_id: batch.tick_id,
                                contributions: batch.contributions,
                            },
                            reply: None,
                        });
                        if send.is_err() {
                            break;
                        }
                    }
                    PeerMsg::Ack(_) => {}
                    other => debug!(?other, "router ignoring message"),
                }
            }
        });
    }

    // Output sink: trace the output region's activity.
    tokio::spawn(async move {
        while let Some(message) = output_rx.recv().await {
            match message {
                PeerMsg::Output(signal) => {
                    debug!(
                        index = signal.output_index,
                        value = signal.value,
                        tick = signal.tick_id,
                        "output event"
                    );
                }
                PeerMsg::OutputVector(segment) => {
                    debug!(
                        tick = segment.tick_id,
                        len = segment.values.len(),
                        "output vector segment"
                    );
                }
                _ => {}
            }
        }
    });

    let tick_period = Duration::from_millis(1_000 / config.tick_hz.max(1) as u64);
    let mut ticker = tokio::time::interval(tick_period.max(Duration::from_millis(1)));
    let mut tick_id = 0u64;
    let mut fired_total = 0u64;
    let mut cost_total = 0i64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                tick_id += 1;
                if config.pulse_every > 0 && tick_id % config.pulse_every == 1 {
                    let _ = shard_tx.send(ShardMsg::Pulse {
                        brain_id: BRAIN_ID,
                        region_id: OUTPUT_REGION,
                        neuron_id: 0,
                        value: config.pulse_value,
                    });
                }
                if shard_tx.send(ShardMsg::Tick { tick: TickCompute { tick_id }, reply: None }).is_err() {
                    warn!("shard mailbox closed, stopping");
                    break;
                }
            }
            done = tick_rx.recv() => {
                match done {
                    Some(PeerMsg::Done(done)) => {
                        fired_total += done.fired_count as u64;
                        cost_total += done.cost_total;
                        if done.tick_id % 100 == 0 {
                            info!(
                                tick = done.tick_id,
                                fired = done.fired_count,
                                cost = done.cost_total,
                                compute_ms = done.compute_ms,
                                "tick complete"
                            );
                        }
                    }
                    Some(other) => debug!(?other, "tick sink ignoring message"),
                    None => {
                        warn!("tick sink closed, stopping");
                        break;
                    }
                }
            }
        }
    }

    info!(ticks = tick_id, fired = fired_total, cost = cost_total, "daemon stopped");
    Ok(())
}

//! Orchestrator: the single-threaded receive → infer → reply → store loop.
//!
//! Each cycle drains the socket, processes every DONE, then at most one
//! STATE per instance (the newest; inference dominates the cycle, so under
//! load the freshest tick wins and the rest are counted as skipped).

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::constants::{HIDDEN_DIM, NUM_DISCRETE_HEADS, NUM_UNITS, UNIT_TARGET_HEAD};
use crate::encoder;
use crate::inference::{resolve_device, HeroStep, HiddenState, InferenceEngine};
use crate::net::UdpEndpoint;
use crate::protocol::{self, GlobalState, MsgType, UnitAction, UnitState};
use crate::reward::RewardShaper;
use crate::rollout::{RolloutWriter, Transition};

const IDLE_SLEEP: Duration = Duration::from_micros(100);
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Process-wide counters, reported every stats interval.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub packets: u64,
    pub inferences: u64,
    pub skipped: u64,
    pub rejected: u64,
}

/// Raw snapshot of the previous tick, kept for reward deltas.
struct PrevTick {
    units: [UnitState; NUM_UNITS],
    global: GlobalState,
}

/// Everything we track per game session. Keyed by client IP; created on the
/// first STATE, destroyed on DONE or tick regression, never by inactivity.
struct InstanceState {
    /// LSTM pair per hero id.
    hidden: HashMap<[u8; 4], HiddenState>,
    prev: Option<PrevTick>,
    shaper: RewardShaper,
    last_tick: u32,
    last_recv: Instant,
}

impl InstanceState {
    fn new() -> Self {
        InstanceState {
            hidden: HashMap::new(),
            prev: None,
            shaper: RewardShaper::new(),
            last_tick: 0,
            last_recv: Instant::now(),
        }
    }
}

/// Classification result for one drain batch: DONE packet indices plus the
/// newest STATE per instance.
#[derive(Debug, Default)]
pub struct Classified {
    pub done: Vec<usize>,
    /// instance key → (packet index, tick)
    pub latest_state: HashMap<String, (usize, u32)>,
    pub skipped: u64,
    pub rejected: u64,
}

/// Partition a drain batch. DONEs are all kept; for STATEs only the highest
/// tick per instance survives, every displaced packet counts as skipped.
/// Unparseable headers count as rejected.
pub fn classify(packets: &[(SocketAddr, Vec<u8>)]) -> Classified {
    let mut result = Classified::default();

    for (idx, (addr, data)) in packets.iter().enumerate() {
        let header = match protocol::parse_header(data) {
            Ok(h) => h,
            Err(_) => {
                result.rejected += 1;
                continue;
            }
        };
        match header.msg_type {
            MsgType::Done => result.done.push(idx),
            MsgType::State => {
                let key = addr.ip().to_string();
                match result.latest_state.entry(key) {
                    Entry::Occupied(mut held) => {
                        if header.tick >= held.get().1 {
                            held.insert((idx, header.tick));
                        }
                        result.skipped += 1;
                    }
                    Entry::Vacant(slot) => {
                        slot.insert((idx, header.tick));
                    }
                }
            }
            // Clients never send ACTION; treat it like a foreign packet.
            MsgType::Action => result.rejected += 1,
        }
    }

    result
}

pub struct Server {
    endpoint: UdpEndpoint,
    engine: InferenceEngine,
    writer: RolloutWriter,
    instances: HashMap<String, InstanceState>,
    stats: ServerStats,
    rollout_size: usize,
    reload_interval: Duration,
    last_reload: Instant,
    last_stats: Instant,
}

impl Server {
    pub fn new(config: &ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let endpoint = UdpEndpoint::bind(config.port, config.send_port)?;
        let device = resolve_device(&config.device);
        let engine = InferenceEngine::new(&config.model_dir, device);
        let writer = RolloutWriter::new(&config.rollout_dir)?;

        Ok(Server {
            endpoint,
            engine,
            writer,
            instances: HashMap::new(),
            stats: ServerStats::default(),
            rollout_size: config.rollout_size,
            reload_interval: Duration::from_secs(config.reload_interval),
            last_reload: Instant::now(),
            last_stats: Instant::now(),
        })
    }

    /// Run forever. The process exits only by signal.
    pub fn run(&mut self) {
        tracing::info!("inference server running");
        loop {
            self.cycle();
        }
    }

    /// One loop iteration: drain, classify, DONEs first, newest STATE per
    /// instance, then periodic housekeeping.
    pub fn cycle(&mut self) {
        let packets = self.endpoint.drain();
        if packets.is_empty() {
            std::thread::sleep(IDLE_SLEEP);
        } else {
            self.process(packets);
        }
        self.periodic();
    }

    /// Packet handling half of the cycle, split out so tests can feed
    /// crafted batches without a socket.
    fn process(&mut self, packets: Vec<(SocketAddr, Vec<u8>)>) {
        let mut classified = classify(&packets);
        self.stats.skipped += classified.skipped;
        self.stats.rejected += classified.rejected;

        // DONEs first: an instance finishing this cycle must not be revived
        // by a STATE queued behind its DONE.
        for &idx in &classified.done {
            let (addr, data) = &packets[idx];
            let key = addr.ip().to_string();
            self.handle_done(&key, data);
            classified.latest_state.remove(&key);
        }

        for (key, (idx, _tick)) in classified.latest_state {
            let (addr, data) = &packets[idx];
            self.handle_state(&key, *addr, data);
        }
    }

    fn handle_done(&mut self, key: &str, data: &[u8]) {
        let done = match protocol::parse_done(data) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(instance = %key, error = %e, "bad DONE packet");
                return;
            }
        };

        tracing::info!(
            instance = %key,
            winner = done.winner,
            reason = done.reason,
            score = format_args!("{}-{}", done.score_team0, done.score_team1),
            tick = done.tick,
            "episode done"
        );

        if self.instances.remove(key).is_some() {
            let terminal = RewardShaper::compute_terminal(done.winner);
            self.writer.mark_last_done(key, &terminal);
            self.writer.flush_episode(key);
        }
    }

    fn handle_state(&mut self, key: &str, addr: SocketAddr, data: &[u8]) {
        let state = match protocol::parse_state(data) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(from = %addr, error = %e, "failed to parse STATE");
                return;
            }
        };
        self.stats.packets += 1;

        // A tick moving backwards means the client started a new episode:
        // flush whatever we had with no terminal signal and start fresh.
        if let Some(inst) = self.instances.get(key) {
            if inst.last_tick > 0 && state.tick < inst.last_tick {
                tracing::info!(
                    instance = %key,
                    old_tick = inst.last_tick,
                    new_tick = state.tick,
                    "tick reset"
                );
                self.writer.mark_last_done(key, &[0.0; NUM_UNITS]);
                self.writer.flush_episode(key);
                self.instances.remove(key);
            }
        }
        let inst = match self.instances.entry(key.to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(slot) => {
                tracing::info!(instance = %key, tick = state.tick, "new instance");
                slot.insert(InstanceState::new())
            }
        };
        inst.last_tick = state.tick;
        inst.last_recv = Instant::now();

        let obs = encoder::encode(&state.units, &state.global, state.pathability.as_deref());
        let masks = encoder::encode_masks(&state.units, &obs.sort_map);
        let sort_map = obs.sort_map;

        let rewards = inst.shaper.compute(
            &state.units,
            &state.global,
            &state.events,
            inst.prev.as_ref().map(|p| &p.global),
        );

        // Inference for all twelve heroes. The pair fed INTO the policy is
        // what the trainer needs, so snapshot it before the forward.
        let mut steps = Vec::with_capacity(NUM_UNITS);
        let mut input_hidden = Vec::with_capacity(NUM_UNITS);

        for i in 0..NUM_UNITS {
            let hero_id = state.units[i].hero_id;
            if !inst.hidden.contains_key(&hero_id) {
                inst.hidden.insert(hero_id, self.engine.init_hidden());
            }
            let hidden = &inst.hidden[&hero_id];

            let snapshot = match hidden.to_vecs() {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(agent = i, error = %e, "hidden snapshot failed");
                    (vec![0.0; HIDDEN_DIM], vec![0.0; HIDDEN_DIM])
                }
            };
            input_hidden.push(snapshot);

            match self.engine.infer_hero(&obs.agents[i], &masks, i, hidden) {
                Ok((step, new_hidden)) => {
                    steps.push(step);
                    inst.hidden.insert(hero_id, new_hidden);
                }
                Err(e) => {
                    // One bad forward must not poison the instance: default
                    // actions, hidden pair carried unchanged.
                    tracing::error!(agent = i, error = %e, "inference failed");
                    steps.push(HeroStep::default_step());
                }
            }
            self.stats.inferences += 1;
        }

        // Transitions only once a previous tick exists; the first STATE of
        // an episode has no reward baseline.
        if inst.prev.is_some() {
            for (i, agent_obs) in obs.agents.into_iter().enumerate() {
                let step = &steps[i];
                let (hx_h, hx_c) = input_hidden[i].clone();
                self.writer.store(
                    key,
                    i,
                    Transition {
                        self_vec: agent_obs.self_vec,
                        ally_vec: agent_obs.ally_vec,
                        enemy_vec: agent_obs.enemy_vec,
                        global_vec: agent_obs.global_vec,
                        grid: agent_obs.grid,
                        masks: (0..NUM_DISCRETE_HEADS)
                            .map(|h| masks.row(h, i).to_vec())
                            .collect(),
                        discrete: step.discrete,
                        move_xy: step.move_xy,
                        point_xy: step.point_xy,
                        log_prob: step.log_prob,
                        value: step.value,
                        reward: rewards[i],
                        done: false,
                        hx_h,
                        hx_c,
                    },
                );
            }
        }

        inst.prev = Some(PrevTick {
            units: state.units,
            global: state.global,
        });

        self.send_actions(addr, state.tick, &steps, &sort_map);
    }

    /// Build and send the ACTION reply. Sampled unit targets are in sorted
    /// enemy coordinates; this is the single place they are translated back
    /// to real offsets.
    fn send_actions(
        &self,
        addr: SocketAddr,
        tick: u32,
        steps: &[HeroStep],
        sort_map: &encoder::SortMap,
    ) {
        let mut actions = [UnitAction::default(); NUM_UNITS];
        for (i, step) in steps.iter().enumerate() {
            let mut discrete = [0u8; NUM_DISCRETE_HEADS];
            for (h, d) in discrete.iter_mut().enumerate() {
                *d = step.discrete[h] as u8;
            }
            let target = discrete[UNIT_TARGET_HEAD];
            if (8..=13).contains(&target) {
                let real = sort_map.real_offset(i, (target - 8) as usize);
                discrete[UNIT_TARGET_HEAD] = 8 + real as u8;
            }

            actions[i] = UnitAction {
                move_x: step.move_xy[0],
                move_y: step.move_xy[1],
                point_x: step.point_xy[0],
                point_y: step.point_xy[1],
                discrete,
            };
        }

        let packet = protocol::encode_action(tick, &actions);
        self.endpoint.send(addr.ip(), &packet);
    }

    fn periodic(&mut self) {
        let now = Instant::now();

        if now.duration_since(self.last_reload) >= self.reload_interval {
            self.engine.maybe_reload();
            self.last_reload = now;
        }

        self.writer.maybe_dump(self.rollout_size);

        if now.duration_since(self.last_stats) >= STATS_INTERVAL {
            tracing::info!(
                packets = self.stats.packets,
                inferences = self.stats.inferences,
                instances = self.instances.len(),
                skipped = self.stats.skipped,
                rejected = self.stats.rejected,
                "server stats"
            );
            self.last_stats = now;
        }
    }
}

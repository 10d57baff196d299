//! Trajectory buffering and episode persistence.
//!
//! Transitions are plain CPU data by construction, so nothing here touches
//! libtorch. Completed episodes are serialized into the FATE tensor
//! container the trainer consumes: named entries of raw little-endian data,
//! all shaped `(T, 12, ...)`, written to a `.tmp` file and atomically
//! renamed to `.pt`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::{
    ALLY_DIM, DISCRETE_HEADS, ENEMY_DIM, GLOBAL_DIM, GRID_CHANNELS, GRID_H, GRID_W, HIDDEN_DIM,
    NUM_DISCRETE_HEADS, NUM_UNITS, SELF_DIM,
};

pub const FATE_MAGIC: &[u8; 4] = b"FATE";

// libtorch scalar-type codes, so the trainer-side reader agrees on dtypes.
pub const DTYPE_I64: u8 = 4;
pub const DTYPE_F32: u8 = 6;
pub const DTYPE_BOOL: u8 = 11;

/// One agent-tick of experience, everything the trainer needs to reconstruct
/// the forward pass. `hx_h`/`hx_c` are the pair that went *into* inference
/// at this tick, not the pair it produced.
#[derive(Debug, Clone)]
pub struct Transition {
    pub self_vec: Vec<f32>,
    pub ally_vec: Vec<f32>,
    pub enemy_vec: Vec<f32>,
    pub global_vec: Vec<f32>,
    pub grid: Vec<f32>,
    /// Availability rows in canonical head order.
    pub masks: Vec<Vec<bool>>,
    pub discrete: [i64; NUM_DISCRETE_HEADS],
    pub move_xy: [f32; 2],
    pub point_xy: [f32; 2],
    pub log_prob: f32,
    pub value: f32,
    pub reward: f32,
    pub done: bool,
    pub hx_h: Vec<f32>,
    pub hx_c: Vec<f32>,
}

/// Twelve trajectories that ended together.
struct CompletedEpisode {
    agents: Vec<Vec<Transition>>,
}

struct WriterState {
    /// instance key → per-agent transition lists
    buffers: HashMap<String, Vec<Vec<Transition>>>,
    completed: Vec<CompletedEpisode>,
    dump_count: u64,
}

/// Per-instance rollout buffers plus the dump path. The mutex exists for a
/// future background writer thread; the orchestrator today is the only
/// caller.
pub struct RolloutWriter {
    rollout_dir: PathBuf,
    state: Mutex<WriterState>,
}

impl RolloutWriter {
    pub fn new(rollout_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let rollout_dir = rollout_dir.into();
        fs::create_dir_all(&rollout_dir)?;
        tracing::info!(dir = %rollout_dir.display(), "rollout output directory ready");
        Ok(RolloutWriter {
            rollout_dir,
            state: Mutex::new(WriterState {
                buffers: HashMap::new(),
                completed: Vec::new(),
                dump_count: 0,
            }),
        })
    }

    /// Append one transition. Out-of-range agent indices are dropped.
    pub fn store(&self, instance: &str, agent: usize, transition: Transition) {
        if agent >= NUM_UNITS {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let buffers = state
            .buffers
            .entry(instance.to_string())
            .or_insert_with(|| vec![Vec::new(); NUM_UNITS]);
        buffers[agent].push(transition);
    }

    /// Mark each agent's last transition done and fold in its terminal
    /// reward. Must run before [`flush_episode`](Self::flush_episode).
    pub fn mark_last_done(&self, instance: &str, terminal_rewards: &[f32; NUM_UNITS]) {
        let mut state = self.state.lock().unwrap();
        let Some(buffers) = state.buffers.get_mut(instance) else {
            return;
        };
        for (agent, traj) in buffers.iter_mut().enumerate() {
            if let Some(last) = traj.last_mut() {
                last.done = true;
                last.reward += terminal_rewards[agent];
            }
        }
    }

    /// Move the instance's trajectories into the completed-episode list and
    /// drop the buffer entry. Episodes with no data at all are discarded.
    pub fn flush_episode(&self, instance: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(agents) = state.buffers.remove(instance) else {
            return;
        };
        if agents.iter().any(|traj| !traj.is_empty()) {
            state.completed.push(CompletedEpisode { agents });
        }
    }

    /// Total transitions sitting in completed episodes.
    pub fn pending_transitions(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .completed
            .iter()
            .map(|ep| ep.agents.iter().map(Vec::len).sum::<usize>())
            .sum()
    }

    /// Serialize every completed episode once the pending total reaches
    /// `min_transitions`. Each episode gets its own file; a failed episode is
    /// logged and lost, the rest still go out.
    pub fn maybe_dump(&self, min_transitions: usize) {
        let mut state = self.state.lock().unwrap();
        let total: usize = state
            .completed
            .iter()
            .map(|ep| ep.agents.iter().map(Vec::len).sum::<usize>())
            .sum();
        if total < min_transitions {
            return;
        }

        let episodes = std::mem::take(&mut state.completed);
        let count = episodes.len();
        for episode in &episodes {
            match dump_episode(&self.rollout_dir, state.dump_count, episode) {
                Ok(path) => {
                    state.dump_count += 1;
                    tracing::info!(path = %path.display(), "saved rollout");
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize episode, dropping it");
                }
            }
        }
        tracing::info!(episodes = count, transitions = total, "rollout dump complete");
    }
}

// ============================================================
// FATE container serialization
// ============================================================

fn write_entry(
    out: &mut impl Write,
    name: &str,
    dtype: u8,
    shape: &[i64],
    data: &[u8],
) -> io::Result<()> {
    out.write_all(&(name.len() as u32).to_le_bytes())?;
    out.write_all(name.as_bytes())?;
    out.write_all(&[dtype])?;
    out.write_all(&(shape.len() as u32).to_le_bytes())?;
    for &dim in shape {
        out.write_all(&dim.to_le_bytes())?;
    }
    let expected: i64 = shape.iter().product::<i64>() * dtype_width(dtype) as i64;
    debug_assert_eq!(expected, data.len() as i64);
    out.write_all(&(data.len() as i64).to_le_bytes())?;
    out.write_all(data)?;
    Ok(())
}

fn dtype_width(dtype: u8) -> usize {
    match dtype {
        DTYPE_I64 => 8,
        DTYPE_F32 => 4,
        DTYPE_BOOL => 1,
        _ => unreachable!("unknown dtype code"),
    }
}

fn episode_len(ep: &CompletedEpisode) -> usize {
    ep.agents.iter().map(Vec::len).max().unwrap_or(0)
}

/// Stack an f32 field of width `dim` into (T, 12, dim) raw bytes,
/// zero-padding agents that ended early.
fn stack_f32(
    ep: &CompletedEpisode,
    t_len: usize,
    dim: usize,
    get: impl Fn(&Transition) -> &[f32],
) -> Vec<u8> {
    let mut data = Vec::with_capacity(t_len * NUM_UNITS * dim * 4);
    let zeros = vec![0.0f32; dim];
    for t in 0..t_len {
        for traj in &ep.agents {
            let row = traj.get(t).map(&get).unwrap_or(zeros.as_slice());
            for v in row {
                data.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
    data
}

/// Stack an f32 scalar into (T, 12) raw bytes.
fn stack_scalar(
    ep: &CompletedEpisode,
    t_len: usize,
    get: impl Fn(&Transition) -> f32,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(t_len * NUM_UNITS * 4);
    for t in 0..t_len {
        for traj in &ep.agents {
            let v = traj.get(t).map(&get).unwrap_or(0.0);
            data.extend_from_slice(&v.to_le_bytes());
        }
    }
    data
}

fn dump_episode(dir: &Path, dump_count: u64, ep: &CompletedEpisode) -> io::Result<PathBuf> {
    let t_len = episode_len(ep);
    if t_len == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "empty episode"));
    }

    let epoch_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let filename = format!("rollout_{:06}_{}.pt", dump_count, epoch_ms);
    let final_path = dir.join(&filename);
    let tmp_path = dir.join(format!("{}.tmp", filename));

    let result = write_container(&tmp_path, t_len, ep).and_then(|()| {
        fs::rename(&tmp_path, &final_path)?;
        Ok(final_path.clone())
    });
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn write_container(tmp_path: &Path, t_len: usize, ep: &CompletedEpisode) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(tmp_path)?);

    let t = t_len as i64;
    let n = NUM_UNITS as i64;

    // 11 fixed entries + per-head masks + per-head discrete actions + move/point
    let num_entries = (11 + 2 * NUM_DISCRETE_HEADS + 2) as u32;
    out.write_all(FATE_MAGIC)?;
    out.write_all(&num_entries.to_le_bytes())?;

    write_entry(
        &mut out,
        "self_vecs",
        DTYPE_F32,
        &[t, n, SELF_DIM as i64],
        &stack_f32(ep, t_len, SELF_DIM, |tr| tr.self_vec.as_slice()),
    )?;
    write_entry(
        &mut out,
        "ally_vecs",
        DTYPE_F32,
        &[t, n, 5, ALLY_DIM as i64],
        &stack_f32(ep, t_len, 5 * ALLY_DIM, |tr| tr.ally_vec.as_slice()),
    )?;
    write_entry(
        &mut out,
        "enemy_vecs",
        DTYPE_F32,
        &[t, n, 6, ENEMY_DIM as i64],
        &stack_f32(ep, t_len, 6 * ENEMY_DIM, |tr| tr.enemy_vec.as_slice()),
    )?;
    write_entry(
        &mut out,
        "global_vecs",
        DTYPE_F32,
        &[t, n, GLOBAL_DIM as i64],
        &stack_f32(ep, t_len, GLOBAL_DIM, |tr| tr.global_vec.as_slice()),
    )?;
    write_entry(
        &mut out,
        "grids",
        DTYPE_F32,
        &[t, n, GRID_CHANNELS as i64, GRID_H as i64, GRID_W as i64],
        &stack_f32(ep, t_len, GRID_CHANNELS * GRID_H * GRID_W, |tr| tr.grid.as_slice()),
    )?;

    write_entry(
        &mut out,
        "log_probs",
        DTYPE_F32,
        &[t, n],
        &stack_scalar(ep, t_len, |tr| tr.log_prob),
    )?;
    write_entry(
        &mut out,
        "values",
        DTYPE_F32,
        &[t, n],
        &stack_scalar(ep, t_len, |tr| tr.value),
    )?;
    write_entry(
        &mut out,
        "rewards",
        DTYPE_F32,
        &[t, n],
        &stack_scalar(ep, t_len, |tr| tr.reward),
    )?;

    // Dones: padded steps count as done so the trainer never bootstraps
    // through them.
    let mut dones = Vec::with_capacity(t_len * NUM_UNITS * 8);
    for step in 0..t_len {
        for traj in &ep.agents {
            let done: i64 = match traj.get(step) {
                Some(tr) if tr.done => 1,
                Some(_) => 0,
                None => 1,
            };
            dones.extend_from_slice(&done.to_le_bytes());
        }
    }
    write_entry(&mut out, "dones", DTYPE_I64, &[t, n], &dones)?;

    write_entry(
        &mut out,
        "hx_h",
        DTYPE_F32,
        &[t, n, 1, HIDDEN_DIM as i64],
        &stack_f32(ep, t_len, HIDDEN_DIM, |tr| tr.hx_h.as_slice()),
    )?;
    write_entry(
        &mut out,
        "hx_c",
        DTYPE_F32,
        &[t, n, 1, HIDDEN_DIM as i64],
        &stack_f32(ep, t_len, HIDDEN_DIM, |tr| tr.hx_c.as_slice()),
    )?;

    // Per-head masks: (T, 12, arity) bool.
    for (h, head) in DISCRETE_HEADS.iter().enumerate() {
        let mut data = Vec::with_capacity(t_len * NUM_UNITS * head.arity);
        for step in 0..t_len {
            for traj in &ep.agents {
                match traj.get(step) {
                    Some(tr) => data.extend(tr.masks[h].iter().map(|&b| b as u8)),
                    None => data.extend(std::iter::repeat(0u8).take(head.arity)),
                }
            }
        }
        write_entry(
            &mut out,
            &format!("mask_{}", head.name),
            DTYPE_BOOL,
            &[t, n, head.arity as i64],
            &data,
        )?;
    }

    // Per-head discrete actions: (T, 12) i64.
    for (h, head) in DISCRETE_HEADS.iter().enumerate() {
        let mut data = Vec::with_capacity(t_len * NUM_UNITS * 8);
        for step in 0..t_len {
            for traj in &ep.agents {
                let v: i64 = traj.get(step).map(|tr| tr.discrete[h]).unwrap_or(0);
                data.extend_from_slice(&v.to_le_bytes());
            }
        }
        write_entry(&mut out, &format!("act_{}", head.name), DTYPE_I64, &[t, n], &data)?;
    }

    // Continuous actions: (T, 12, 2) f32.
    write_entry(
        &mut out,
        "act_move",
        DTYPE_F32,
        &[t, n, 2],
        &stack_f32(ep, t_len, 2, |tr| tr.move_xy.as_slice()),
    )?;
    write_entry(
        &mut out,
        "act_point",
        DTYPE_F32,
        &[t, n, 2],
        &stack_f32(ep, t_len, 2, |tr| tr.point_xy.as_slice()),
    )?;

    out.flush()
}

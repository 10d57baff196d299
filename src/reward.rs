//! Per-tick and terminal reward shaping.
//!
//! The pipeline order is fixed: event rewards, score deltas, per-tick
//! shaping, team-spirit blending, zero-sum normalization, time decay.
//! Reordering any of these changes the semantics of stored rewards.

use crate::constants::{reward as rw, NUM_UNITS, TEAM_SIZE};
use crate::protocol::{EventKind, GameEvent, GlobalState, UnitState};

/// Stateful reward computer for one game instance. Tracks previous positions
/// for the idle penalty; everything else is a pure function of the tick.
#[derive(Debug)]
pub struct RewardShaper {
    prev_pos: [[f32; 2]; NUM_UNITS],
    has_prev_pos: bool,
}

impl Default for RewardShaper {
    fn default() -> Self {
        Self::new()
    }
}

impl RewardShaper {
    pub fn new() -> Self {
        RewardShaper {
            prev_pos: [[0.0; 2]; NUM_UNITS],
            has_prev_pos: false,
        }
    }

    pub fn reset(&mut self) {
        self.prev_pos = [[0.0; 2]; NUM_UNITS];
        self.has_prev_pos = false;
    }

    /// Compute this tick's reward for all twelve agents.
    /// `prev_global` is the previous tick's global state, absent on the
    /// first tick of an episode (score deltas need a baseline).
    pub fn compute(
        &mut self,
        units: &[UnitState; NUM_UNITS],
        global: &GlobalState,
        events: &[GameEvent],
        prev_global: Option<&GlobalState>,
    ) -> [f32; NUM_UNITS] {
        let mut rewards = [0.0f32; NUM_UNITS];

        apply_event_rewards(events, &mut rewards);
        if let Some(prev) = prev_global {
            apply_score_deltas(global, prev, &mut rewards);
        }
        self.apply_tick_shaping(units, &mut rewards);

        apply_team_spirit(&mut rewards, rw::TEAM_SPIRIT);
        apply_zero_sum(&mut rewards);
        apply_time_decay(&mut rewards, global.game_time);

        rewards
    }

    /// Terminal reward from the episode outcome: winner 0/1, anything else
    /// is a draw/timeout.
    pub fn compute_terminal(winner: u8) -> [f32; NUM_UNITS] {
        let mut rewards = [rw::TIMEOUT; NUM_UNITS];
        match winner {
            0 => {
                rewards[..TEAM_SIZE].fill(rw::WIN);
                rewards[TEAM_SIZE..].fill(rw::LOSE);
            }
            1 => {
                rewards[..TEAM_SIZE].fill(rw::LOSE);
                rewards[TEAM_SIZE..].fill(rw::WIN);
            }
            _ => {}
        }
        rewards
    }

    /// Idle and unspent-skill-point penalties for living units. Also refreshes
    /// the position baseline; dead units keep their last known position.
    fn apply_tick_shaping(&mut self, units: &[UnitState; NUM_UNITS], rewards: &mut [f32; NUM_UNITS]) {
        for (i, unit) in units.iter().enumerate() {
            if unit.alive == 0 {
                continue;
            }

            if self.has_prev_pos {
                let dx = unit.x - self.prev_pos[i][0];
                let dy = unit.y - self.prev_pos[i][1];
                if (dx * dx + dy * dy).sqrt() < rw::IDLE_DISTANCE {
                    rewards[i] += rw::IDLE_PENALTY;
                }
            }
            self.prev_pos[i] = [unit.x, unit.y];

            if unit.skill_points > 0 {
                rewards[i] += rw::SKILL_POINTS_HELD * unit.skill_points as f32;
            }
        }
        self.has_prev_pos = true;
    }
}

fn team_of(idx: usize) -> usize {
    if idx < TEAM_SIZE {
        0
    } else {
        1
    }
}

/// Stage 1: individual event rewards. Cross-team kills pay the killer; a
/// friendly kill penalizes the killer instead. The victim always eats the
/// death penalty.
fn apply_event_rewards(events: &[GameEvent], rewards: &mut [f32; NUM_UNITS]) {
    for ev in events {
        match ev.kind {
            EventKind::Kill => {
                let killer = ev.killer_idx as usize;
                let victim = ev.victim_idx as usize;
                if killer >= NUM_UNITS || victim >= NUM_UNITS {
                    continue;
                }
                if team_of(killer) != team_of(victim) {
                    rewards[killer] += rw::KILL_PERSONAL;
                } else {
                    rewards[killer] += rw::FRIENDLY_KILL;
                }
                rewards[victim] += rw::DEATH;
            }
            EventKind::CreepKill => {
                if let Some(r) = rewards.get_mut(ev.killer_idx as usize) {
                    *r += rw::CREEP;
                }
            }
            EventKind::LevelUp => {
                // killer_idx carries the unit index for level-ups.
                if let Some(r) = rewards.get_mut(ev.killer_idx as usize) {
                    *r += rw::LEVELUP;
                }
            }
        }
    }
}

/// Stage 2: every member of a team that scored gets score_point per point.
fn apply_score_deltas(global: &GlobalState, prev: &GlobalState, rewards: &mut [f32; NUM_UNITS]) {
    let delta_t0 = global.score_team0 - prev.score_team0;
    if delta_t0 > 0 {
        for r in rewards[..TEAM_SIZE].iter_mut() {
            *r += rw::SCORE_POINT * delta_t0 as f32;
        }
    }
    let delta_t1 = global.score_team1 - prev.score_team1;
    if delta_t1 > 0 {
        for r in rewards[TEAM_SIZE..].iter_mut() {
            *r += rw::SCORE_POINT * delta_t1 as f32;
        }
    }
}

/// Stage 4: blend each agent toward its team mean: τ·mean + (1−τ)·individual.
fn apply_team_spirit(rewards: &mut [f32; NUM_UNITS], tau: f32) {
    for team in 0..2 {
        let base = team * TEAM_SIZE;
        let mean: f32 =
            rewards[base..base + TEAM_SIZE].iter().sum::<f32>() / TEAM_SIZE as f32;
        for r in rewards[base..base + TEAM_SIZE].iter_mut() {
            *r = tau * mean + (1.0 - tau) * *r;
        }
    }
}

/// Stage 5: subtract the opposing team's mean so the field sums to zero.
fn apply_zero_sum(rewards: &mut [f32; NUM_UNITS]) {
    let mean_t0: f32 = rewards[..TEAM_SIZE].iter().sum::<f32>() / TEAM_SIZE as f32;
    let mean_t1: f32 = rewards[TEAM_SIZE..].iter().sum::<f32>() / TEAM_SIZE as f32;
    for r in rewards[..TEAM_SIZE].iter_mut() {
        *r -= mean_t1;
    }
    for r in rewards[TEAM_SIZE..].iter_mut() {
        *r -= mean_t0;
    }
}

/// Stage 6: exponential decay, base^(game_time / interval).
fn apply_time_decay(rewards: &mut [f32; NUM_UNITS], game_time: f32) {
    let decay = rw::TIME_DECAY_BASE.powf(game_time / rw::TIME_DECAY_INTERVAL);
    for r in rewards.iter_mut() {
        *r *= decay;
    }
}

//! State encoder: twelve egocentric observations per tick.
//!
//! Each agent sees itself, its five allies in fixed player order, and the six
//! opposing heroes sorted by (visible-alive first, then distance, then slot).
//! The sort permutation is recorded so the action mask and the outgoing
//! ACTION packet can translate between sorted and real enemy coordinates.

use std::f32::consts::PI;

use crate::constants::{
    hero_index, norm, ALLY_DIM, CELL_SIZE, DISCRETE_HEADS, ENEMY_DIM, GLOBAL_DIM, GRID_CELLS,
    GRID_CHANNELS, GRID_H, GRID_W, MAP_MIN_X, MAP_MIN_Y, NUM_DISCRETE_HEADS, NUM_UNITS, SELF_DIM,
    TEAM_SIZE, UNIT_TARGET_HEAD,
};
use crate::protocol::{GlobalState, UnitState};

/// Per-observer permutation: `sorted_to_real[i][s]` is the real enemy offset
/// (0-5 within the opposing team) shown in sorted slot `s` of observer `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortMap {
    pub sorted_to_real: [[usize; TEAM_SIZE]; NUM_UNITS],
}

impl SortMap {
    pub fn identity() -> Self {
        SortMap {
            sorted_to_real: [[0, 1, 2, 3, 4, 5]; NUM_UNITS],
        }
    }

    /// Translate a sorted enemy slot back to the real offset for `agent`.
    pub fn real_offset(&self, agent: usize, sorted_slot: usize) -> usize {
        self.sorted_to_real[agent][sorted_slot]
    }
}

/// One agent's observation tensors, flat row-major f32 buffers.
#[derive(Debug, Clone)]
pub struct AgentObs {
    pub self_vec: Vec<f32>,   // (SELF_DIM,)
    pub ally_vec: Vec<f32>,   // (5, ALLY_DIM)
    pub enemy_vec: Vec<f32>,  // (6, ENEMY_DIM)
    pub global_vec: Vec<f32>, // (GLOBAL_DIM,)
    pub grid: Vec<f32>,       // (3, GRID_H, GRID_W)
}

/// All twelve perspectives of one tick plus the enemy sort permutations.
#[derive(Debug, Clone)]
pub struct EncodedObs {
    pub agents: Vec<AgentObs>,
    pub sort_map: SortMap,
}

/// Boolean availability masks, one row set per discrete head.
#[derive(Debug, Clone)]
pub struct MaskSet {
    /// Indexed `[head]`, each entry `NUM_UNITS * arity` row-major bools.
    rows: Vec<Vec<bool>>,
}

impl MaskSet {
    /// All-allowed masks, used when inference runs without packet context.
    pub fn all_allowed() -> Self {
        MaskSet {
            rows: DISCRETE_HEADS
                .iter()
                .map(|h| vec![true; NUM_UNITS * h.arity])
                .collect(),
        }
    }

    /// One agent's row for one head.
    pub fn row(&self, head: usize, agent: usize) -> &[bool] {
        let arity = DISCRETE_HEADS[head].arity;
        &self.rows[head][agent * arity..(agent + 1) * arity]
    }

    pub fn get(&self, head: usize, agent: usize, col: usize) -> bool {
        self.row(head, agent)[col]
    }
}

fn team_of(idx: usize) -> usize {
    if idx < TEAM_SIZE {
        0
    } else {
        1
    }
}

fn visible_to(unit: &UnitState, observer: usize) -> bool {
    (unit.visible_mask >> observer) & 1 == 1
}

/// (atan2(dy,dx)/π, dist/10000) of `other` relative to `me`.
fn polar_relative(me: &UnitState, other: &UnitState) -> (f32, f32) {
    let dx = other.x - me.x;
    let dy = other.y - me.y;
    (dy.atan2(dx) / PI, (dx * dx + dy * dy).sqrt() / norm::XY)
}

fn world_to_cell(x: f32, y: f32) -> (usize, usize) {
    let gx = (((x - MAP_MIN_X) / CELL_SIZE) as isize).clamp(0, GRID_W as isize - 1);
    let gy = (((y - MAP_MIN_Y) / CELL_SIZE) as isize).clamp(0, GRID_H as isize - 1);
    (gx as usize, gy as usize)
}

// ============================================================
// Per-entity vectors
// ============================================================

fn encode_self(u: &UnitState, out: &mut Vec<f32>) {
    let start = out.len();
    if u.alive == 0 {
        // Dead units are fully zeroed, hero one-hot included.
        out.resize(start + SELF_DIM, 0.0);
        return;
    }

    // Basic (6)
    out.push(u.hp / norm::HP);
    out.push(u.max_hp / norm::HP);
    out.push(u.mp / norm::MP);
    out.push(u.max_mp / norm::MP);
    out.push(u.x / norm::XY);
    out.push(u.y / norm::XY);

    // Stats (5)
    out.push(u.str_ as f32 / norm::STAT);
    out.push(u.agi as f32 / norm::STAT);
    out.push(u.int_ as f32 / norm::STAT);
    out.push(u.atk / norm::ATK);
    out.push(u.def_ / norm::DEF);

    // Upgrades (9)
    for k in 0..9 {
        out.push(u.upgrades[k] as f32 / 50.0);
    }

    // Combat (3)
    out.push(u.move_spd / norm::MOVE_SPD);
    out.push(u.atk_range / 1000.0);
    out.push(u.atk_spd / 3.0);

    // Growth (4)
    out.push(u.level as f32 / norm::LEVEL);
    out.push(u.xp as f32 / 50_000.0);
    out.push(u.skill_points as f32 / 10.0);
    out.push(u.stat_points as f32 / 200.0);

    // Skills (12): six slots of (cd_remain, level)
    for slot in &u.skills {
        out.push(slot.cd_remain / norm::CD);
        out.push(slot.level as f32 / 10.0);
    }

    // Attributes (4)
    for b in 0..4 {
        out.push(((u.attributes >> b) & 1) as f32);
    }

    // Buffs (6): stun|slow|silence|knockback|root|invuln
    for b in 0..6 {
        out.push(((u.buffs >> b) & 1) as f32);
    }

    // Seal (4)
    out.push(u.seal_charges as f32 / 12.0);
    out.push(u.seal_cd as f32 / 30.0);
    out.push(u.seal_first_active as f32);
    out.push(u.seal_first_remain / 30.0);

    // Items (6)
    for item in &u.items {
        out.push(item.type_id as f32 / 20.0);
    }

    // Economy (3); faire_regen is a placeholder kept at zero so the tensor
    // shape stays stable for the trainer.
    out.push(u.faire as f32 / norm::FAIRE);
    out.push(0.0);
    out.push(u.faire_cap as f32 / 20_000.0);

    // Velocity (2)
    out.push(u.vel_x / 500.0);
    out.push(u.vel_y / 500.0);

    // Alive (1)
    out.push(1.0);

    // Hero one-hot (12)
    let hero = hero_index(&u.hero_id);
    for h in 0..NUM_UNITS {
        out.push(if h == hero { 1.0 } else { 0.0 });
    }

    debug_assert_eq!(out.len() - start, SELF_DIM);
}

fn encode_ally(me: &UnitState, ally: &UnitState, out: &mut Vec<f32>) {
    let start = out.len();
    if ally.alive == 0 {
        out.resize(start + ALLY_DIM, 0.0);
        return;
    }

    // Basic (6)
    out.push(ally.hp / norm::HP);
    out.push(ally.max_hp / norm::HP);
    out.push(ally.mp / norm::MP);
    out.push(ally.max_mp / norm::MP);
    out.push(ally.x / norm::XY);
    out.push(ally.y / norm::XY);

    // Stats (5)
    out.push(ally.str_ as f32 / norm::STAT);
    out.push(ally.agi as f32 / norm::STAT);
    out.push(ally.int_ as f32 / norm::STAT);
    out.push(ally.atk / norm::ATK);
    out.push(ally.def_ / norm::DEF);

    // Combat (3)
    out.push(ally.move_spd / norm::MOVE_SPD);
    out.push(ally.atk_range / 1000.0);
    out.push(ally.atk_spd / 3.0);

    // Level (1)
    out.push(ally.level as f32 / norm::LEVEL);

    // Skill cooldowns (6)
    for slot in &ally.skills {
        out.push(slot.cd_remain / norm::CD);
    }

    // Buffs (6)
    for b in 0..6 {
        out.push(((ally.buffs >> b) & 1) as f32);
    }

    // Alive (1)
    out.push(1.0);

    // Seal charges (1)
    out.push(ally.seal_charges as f32 / 12.0);

    // Faire (1)
    out.push(ally.faire as f32 / norm::FAIRE);

    // Velocity (2)
    out.push(ally.vel_x / 500.0);
    out.push(ally.vel_y / 500.0);

    // Relative position (2)
    let (angle, dist) = polar_relative(me, ally);
    out.push(angle);
    out.push(dist);

    // Reserved tail
    out.resize(start + ALLY_DIM, 0.0);
    debug_assert_eq!(out.len() - start, ALLY_DIM);
}

fn encode_enemy(me: &UnitState, enemy: &UnitState, visible: bool, out: &mut Vec<f32>) {
    let start = out.len();
    let hero = hero_index(&enemy.hero_id);

    if enemy.alive == 0 {
        // Dead: hero identity only.
        out.resize(start + ENEMY_DIM, 0.0);
        out[start + 23 + hero] = 1.0;
        return;
    }

    if !visible {
        // Fog of war: the observer knows the hero exists and lives, nothing
        // else. Offsets match the full layout below (alive at 22).
        out.resize(start + ENEMY_DIM, 0.0);
        out[start + 22] = 1.0;
        out[start + 23 + hero] = 1.0;
        return;
    }

    // Visible (1)
    out.push(1.0);

    // Basic (6)
    out.push(enemy.hp / norm::HP);
    out.push(enemy.max_hp / norm::HP);
    out.push(enemy.mp / norm::MP);
    out.push(enemy.max_mp / norm::MP);
    out.push(enemy.x / norm::XY);
    out.push(enemy.y / norm::XY);

    // Public stats (7)
    out.push(enemy.str_ as f32 / norm::STAT);
    out.push(enemy.agi as f32 / norm::STAT);
    out.push(enemy.int_ as f32 / norm::STAT);
    out.push(enemy.atk / norm::ATK);
    out.push(enemy.def_ / norm::DEF);
    out.push(enemy.max_hp / norm::HP);
    out.push(enemy.max_mp / norm::MP);

    // Growth (2); death_count placeholder stays zero.
    out.push(enemy.level as f32 / norm::LEVEL);
    out.push(0.0);

    // Buffs (6)
    for b in 0..6 {
        out.push(((enemy.buffs >> b) & 1) as f32);
    }

    // Alive (1)
    out.push(1.0);

    // Hero one-hot (12)
    for h in 0..NUM_UNITS {
        out.push(if h == hero { 1.0 } else { 0.0 });
    }

    // Velocity (2)
    out.push(enemy.vel_x / 500.0);
    out.push(enemy.vel_y / 500.0);

    // Belief attributes (4): not yet conveyed by the client, -1 sentinels.
    out.extend_from_slice(&[-1.0, -1.0, -1.0, -1.0]);

    // Relative position (2)
    let (angle, dist) = polar_relative(me, enemy);
    out.push(angle);
    out.push(dist);

    debug_assert_eq!(out.len() - start, ENEMY_DIM);
}

fn encode_global(g: &GlobalState, my_team: usize, out: &mut Vec<f32>) {
    out.push(g.game_time / norm::GAME_TIME);
    out.push(g.is_night as f32);

    // Scores from the observer's perspective
    let (mine, theirs) = if my_team == 0 {
        (g.score_team0, g.score_team1)
    } else {
        (g.score_team1, g.score_team0)
    };
    out.push(mine as f32 / norm::SCORE);
    out.push(theirs as f32 / norm::SCORE);

    out.push(g.c_rank_stock as f32 / 8.0);
    out.push(0.0);
}

fn encode_grid(
    observer: usize,
    units: &[UnitState; NUM_UNITS],
    pathability: Option<&[u8]>,
    out: &mut Vec<f32>,
) {
    let start = out.len();
    out.resize(start + GRID_CHANNELS * GRID_CELLS, 0.0);

    // Channel 0: pathability (0=fog, 1=walkable, 2=unwalkable), halved.
    if let Some(plane) = pathability {
        if plane.len() == GRID_CELLS {
            for (cell, &v) in plane.iter().enumerate() {
                out[start + cell] = v as f32 / 2.0;
            }
        }
    }

    // Channel 1: allies; channel 2: enemies the observer can see.
    let my_team = team_of(observer);
    for (j, unit) in units.iter().enumerate() {
        if unit.alive == 0 {
            continue;
        }
        let (gx, gy) = world_to_cell(unit.x, unit.y);
        let cell = gy * GRID_W + gx;
        if team_of(j) == my_team {
            out[start + GRID_CELLS + cell] = 1.0;
        } else if visible_to(unit, observer) {
            out[start + 2 * GRID_CELLS + cell] = 1.0;
        }
    }
}

// ============================================================
// Enemy ordering
// ============================================================

/// Sort rank: visible living enemies first, then hidden living, then dead.
fn enemy_rank(enemy: &UnitState, observer: usize) -> u8 {
    if enemy.alive != 0 && visible_to(enemy, observer) {
        0
    } else if enemy.alive != 0 {
        1
    } else {
        2
    }
}

fn sorted_enemy_offsets(
    observer: usize,
    me: &UnitState,
    units: &[UnitState; NUM_UNITS],
) -> [usize; TEAM_SIZE] {
    let enemy_base = if team_of(observer) == 0 { TEAM_SIZE } else { 0 };

    let mut order: Vec<(u8, f32, usize)> = (0..TEAM_SIZE)
        .map(|off| {
            let enemy = &units[enemy_base + off];
            let dx = enemy.x - me.x;
            let dy = enemy.y - me.y;
            (enemy_rank(enemy, observer), dx * dx + dy * dy, off)
        })
        .collect();
    order.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut result = [0; TEAM_SIZE];
    for (slot, (_, _, off)) in order.into_iter().enumerate() {
        result[slot] = off;
    }
    result
}

// ============================================================
// Entry points
// ============================================================

/// Encode all twelve perspectives of one tick.
pub fn encode(
    units: &[UnitState; NUM_UNITS],
    global: &GlobalState,
    pathability: Option<&[u8]>,
) -> EncodedObs {
    let mut agents = Vec::with_capacity(NUM_UNITS);
    let mut sort_map = SortMap::identity();

    for i in 0..NUM_UNITS {
        let me = &units[i];
        let my_team = team_of(i);

        let mut self_vec = Vec::with_capacity(SELF_DIM);
        encode_self(me, &mut self_vec);

        // Allies: the five same-team slots in fixed player order.
        let mut ally_vec = Vec::with_capacity((TEAM_SIZE - 1) * ALLY_DIM);
        let team_base = my_team * TEAM_SIZE;
        for j in team_base..team_base + TEAM_SIZE {
            if j == i {
                continue;
            }
            encode_ally(me, &units[j], &mut ally_vec);
        }

        // Enemies: distance-sorted, fog-redacted.
        let order = sorted_enemy_offsets(i, me, units);
        sort_map.sorted_to_real[i] = order;

        let enemy_base = if my_team == 0 { TEAM_SIZE } else { 0 };
        let mut enemy_vec = Vec::with_capacity(TEAM_SIZE * ENEMY_DIM);
        for &off in &order {
            let enemy = &units[enemy_base + off];
            encode_enemy(me, enemy, visible_to(enemy, i), &mut enemy_vec);
        }

        let mut global_vec = Vec::with_capacity(GLOBAL_DIM);
        encode_global(global, my_team, &mut global_vec);

        let mut grid = Vec::with_capacity(GRID_CHANNELS * GRID_CELLS);
        encode_grid(i, units, pathability, &mut grid);

        agents.push(AgentObs {
            self_vec,
            ally_vec,
            enemy_vec,
            global_vec,
            grid,
        });
    }

    EncodedObs { agents, sort_map }
}

/// Unpack the eleven bit-packed mask fields into boolean rows. The
/// unit_target head's enemy range (columns 8-13) is reindexed through the
/// sort map so the policy samples in sorted coordinates; the codec reverses
/// the mapping on emit. Visibility never feeds into masking.
pub fn encode_masks(units: &[UnitState; NUM_UNITS], sort_map: &SortMap) -> MaskSet {
    let mut rows = Vec::with_capacity(NUM_DISCRETE_HEADS);

    for (h, head) in DISCRETE_HEADS.iter().enumerate() {
        let mut bits = vec![false; NUM_UNITS * head.arity];
        for (i, unit) in units.iter().enumerate() {
            let base = i * head.arity;
            if h == UNIT_TARGET_HEAD {
                // 0-5 allies, 6-7 no-target / attack-point: pass through.
                for b in 0..8 {
                    bits[base + b] = unit.mask_bit(h, b);
                }
                // 8-13 enemies: sorted slot s carries the bit of its real offset.
                for s in 0..TEAM_SIZE {
                    let real = sort_map.sorted_to_real[i][s];
                    bits[base + 8 + s] = unit.mask_bit(h, 8 + real);
                }
            } else {
                for b in 0..head.arity {
                    bits[base + b] = unit.mask_bit(h, b);
                }
            }
        }
        rows.push(bits);
    }

    MaskSet { rows }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::HERO_IDS;

    fn unit(idx: usize, x: f32, y: f32, alive: bool, visible_mask: u16) -> UnitState {
        UnitState {
            idx: idx as u8,
            hero_id: *HERO_IDS[idx],
            team: if idx < 6 { 0 } else { 1 },
            x,
            y,
            alive: alive as u8,
            visible_mask,
            hp: 1000.0,
            max_hp: 2000.0,
            mp: 100.0,
            max_mp: 400.0,
            ..UnitState::default()
        }
    }

    fn all_alive_field() -> [UnitState; NUM_UNITS] {
        std::array::from_fn(|i| unit(i, (i as f32) * 100.0, 0.0, true, 0x0FFF))
    }

    #[test]
    fn observation_dimensions() {
        let units = all_alive_field();
        let obs = encode(&units, &GlobalState::default(), None);
        assert_eq!(obs.agents.len(), NUM_UNITS);
        for agent in &obs.agents {
            assert_eq!(agent.self_vec.len(), SELF_DIM);
            assert_eq!(agent.ally_vec.len(), (TEAM_SIZE - 1) * ALLY_DIM);
            assert_eq!(agent.enemy_vec.len(), TEAM_SIZE * ENEMY_DIM);
            assert_eq!(agent.global_vec.len(), GLOBAL_DIM);
            assert_eq!(agent.grid.len(), GRID_CHANNELS * GRID_CELLS);
        }
    }

    #[test]
    fn sort_map_is_permutation() {
        let mut units = all_alive_field();
        units[7].alive = 0;
        units[9].visible_mask = 0;
        let obs = encode(&units, &GlobalState::default(), None);
        for i in 0..NUM_UNITS {
            let mut seen = [false; TEAM_SIZE];
            for s in 0..TEAM_SIZE {
                seen[obs.sort_map.sorted_to_real[i][s]] = true;
            }
            assert!(seen.iter().all(|&s| s), "agent {} map not a permutation", i);
        }
    }

    #[test]
    fn enemies_sort_by_rank_then_distance() {
        let mut units = all_alive_field();
        // Observer 0 sits at origin.
        units[0].x = 0.0;
        // Enemy offsets 0..5 are units 6..11. Offset 0 far, offset 3 near.
        units[6].x = 5000.0;
        units[7].x = 3000.0;
        units[8].x = 4000.0;
        units[9].x = 500.0;
        units[10].x = 2000.0;
        units[11].x = 1000.0;
        // Offset 4 (unit 10) is hidden from observer 0, offset 5 (unit 11) dead.
        units[10].visible_mask = 0;
        units[11].alive = 0;

        let obs = encode(&units, &GlobalState::default(), None);
        // Visible alive by distance: 3 (500), 1 (3000), 2 (4000), 0 (5000);
        // then hidden alive 4; then dead 5.
        assert_eq!(obs.sort_map.sorted_to_real[0], [3, 1, 2, 0, 4, 5]);
    }

    #[test]
    fn mask_matches_sorted_order() {
        let mut units = all_alive_field();
        units[6].x = 5000.0;
        units[9].x = 100.0;
        // Raw unit_target: allow bits 8 (offset 0) and 11 (offset 3) only.
        for u in units.iter_mut() {
            u.mask_unit_target = (1 << 8) | (1 << 11);
        }
        let obs = encode(&units, &GlobalState::default(), None);
        let masks = encode_masks(&units, &obs.sort_map);

        for i in 0..NUM_UNITS {
            for s in 0..TEAM_SIZE {
                let real = obs.sort_map.sorted_to_real[i][s];
                let expected = units[i].mask_bit(UNIT_TARGET_HEAD, 8 + real);
                assert_eq!(
                    masks.get(UNIT_TARGET_HEAD, i, 8 + s),
                    expected,
                    "agent {} sorted slot {}",
                    i,
                    s
                );
            }
        }
    }

    #[test]
    fn non_target_heads_pass_through() {
        let mut units = all_alive_field();
        units[4].mask_skill = 0b1010_0101;
        units[4].mask_item_buy = 0x0001_0001;
        let obs = encode(&units, &GlobalState::default(), None);
        let masks = encode_masks(&units, &obs.sort_map);

        for b in 0..8 {
            assert_eq!(masks.get(0, 4, b), (0b1010_0101 >> b) & 1 == 1);
        }
        assert!(masks.get(5, 4, 0));
        assert!(masks.get(5, 4, 16));
        assert!(!masks.get(5, 4, 8));
    }

    #[test]
    fn fog_of_war_redacts_everything_but_alive_and_identity() {
        let mut units = all_alive_field();
        // Unit 8 (enemy offset 2 for team 0) alive but invisible to everyone.
        units[8].visible_mask = 0;
        units[8].hp = 1234.0;
        units[8].vel_x = 300.0;
        units[8].buffs = 0x3F;

        let obs = encode(&units, &GlobalState::default(), None);
        let hero = hero_index(&units[8].hero_id);

        for observer in 0..TEAM_SIZE {
            // Find the sorted slot holding real offset 2.
            let slot = (0..TEAM_SIZE)
                .find(|&s| obs.sort_map.sorted_to_real[observer][s] == 2)
                .unwrap();
            let row = &obs.agents[observer].enemy_vec[slot * ENEMY_DIM..(slot + 1) * ENEMY_DIM];
            for (k, &v) in row.iter().enumerate() {
                if k == 22 || k == 23 + hero {
                    assert_eq!(v, 1.0, "observer {} dim {}", observer, k);
                } else {
                    assert_eq!(v, 0.0, "observer {} dim {} leaked", observer, k);
                }
            }
        }
    }

    #[test]
    fn visibility_does_not_mask_targets() {
        let mut units = all_alive_field();
        units[8].visible_mask = 0;
        for u in units.iter_mut() {
            u.mask_unit_target = 0x3FFF;
        }
        let obs = encode(&units, &GlobalState::default(), None);
        let masks = encode_masks(&units, &obs.sort_map);
        // Every enemy column stays allowed even though unit 8 is hidden.
        for s in 0..TEAM_SIZE {
            assert!(masks.get(UNIT_TARGET_HEAD, 0, 8 + s));
        }
    }

    #[test]
    fn dead_enemy_keeps_identity_only() {
        let mut units = all_alive_field();
        units[11].alive = 0;
        units[11].hp = 999.0;
        let obs = encode(&units, &GlobalState::default(), None);
        let hero = hero_index(&units[11].hero_id);

        // Dead enemies sort last for every team-0 observer.
        let slot = TEAM_SIZE - 1;
        assert_eq!(obs.sort_map.sorted_to_real[0][slot], 5);
        let row = &obs.agents[0].enemy_vec[slot * ENEMY_DIM..(slot + 1) * ENEMY_DIM];
        for (k, &v) in row.iter().enumerate() {
            if k == 23 + hero {
                assert_eq!(v, 1.0);
            } else {
                assert_eq!(v, 0.0);
            }
        }
    }

    #[test]
    fn dead_self_and_ally_are_zero() {
        let mut units = all_alive_field();
        units[0].alive = 0;
        units[1].alive = 0;
        let obs = encode(&units, &GlobalState::default(), None);
        assert!(obs.agents[0].self_vec.iter().all(|&v| v == 0.0));
        // Unit 1 is agent 2's first ally row.
        let row = &obs.agents[2].ally_vec[..ALLY_DIM];
        assert!(row.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn ally_polar_features() {
        let mut units = all_alive_field();
        units[0].x = 0.0;
        units[0].y = 0.0;
        units[1].x = 0.0;
        units[1].y = 300.0; // straight "north": atan2(300, 0) = π/2
        let obs = encode(&units, &GlobalState::default(), None);

        let row = &obs.agents[0].ally_vec[..ALLY_DIM];
        let angle = row[32];
        let dist = row[33];
        assert!((angle - 0.5).abs() < 1e-6);
        assert!((dist - 300.0 / norm::XY).abs() < 1e-6);
        // Reserved tail stays zero.
        assert_eq!(&row[34..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn global_scores_swap_by_team() {
        let units = all_alive_field();
        let global = GlobalState {
            score_team0: 35,
            score_team1: 14,
            ..GlobalState::default()
        };
        let obs = encode(&units, &global, None);
        assert!((obs.agents[0].global_vec[2] - 0.5).abs() < 1e-6);
        assert!((obs.agents[0].global_vec[3] - 0.2).abs() < 1e-6);
        assert!((obs.agents[6].global_vec[2] - 0.2).abs() < 1e-6);
        assert!((obs.agents[6].global_vec[3] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn grid_channels() {
        let mut units = all_alive_field();
        // Park everyone on a distinct known cell along the bottom row.
        for (i, u) in units.iter_mut().enumerate() {
            u.x = MAP_MIN_X + 10.0 + (i as f32) * 500.0;
            u.y = MAP_MIN_Y + 10.0;
        }
        units[7].visible_mask = 0;

        let mut pathability = vec![0u8; GRID_CELLS];
        pathability[0] = 2;
        let obs = encode(&units, &GlobalState::default(), Some(&pathability));

        let me = &obs.agents[0];
        assert_eq!(me.grid[0], 1.0); // 2 / 2

        let (gx0, gy0) = world_to_cell(units[0].x, units[0].y);
        assert_eq!(me.grid[GRID_CELLS + gy0 * GRID_W + gx0], 1.0);

        let (gx6, gy6) = world_to_cell(units[6].x, units[6].y);
        assert_eq!(me.grid[2 * GRID_CELLS + gy6 * GRID_W + gx6], 1.0);

        // Hidden enemy leaves no marker for observer 0.
        let (gx7, gy7) = world_to_cell(units[7].x, units[7].y);
        assert_eq!(me.grid[2 * GRID_CELLS + gy7 * GRID_W + gx7], 0.0);
    }

    #[test]
    fn cell_clamping() {
        assert_eq!(world_to_cell(-99_999.0, -99_999.0), (0, 0));
        assert_eq!(world_to_cell(99_999.0, 99_999.0), (GRID_W - 1, GRID_H - 1));
    }
}

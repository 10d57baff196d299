//! Game constants: hero table, observation dimensions, normalization divisors

/// Number of controllable heroes (two teams of six).
pub const NUM_UNITS: usize = 12;
/// Heroes per team.
pub const TEAM_SIZE: usize = 6;
/// Events per STATE packet are capped here; surplus is dropped by the codec.
pub const MAX_EVENTS: usize = 32;

// Observation grid geometry. One cell is 350 world units.
pub const GRID_W: usize = 48;
pub const GRID_H: usize = 25;
pub const GRID_CELLS: usize = GRID_W * GRID_H;
pub const GRID_CHANNELS: usize = 3;

pub const MAP_MIN_X: f32 = -8416.0;
pub const MAP_MAX_X: f32 = 8320.0;
pub const MAP_MIN_Y: f32 = -2592.0;
pub const MAP_MAX_Y: f32 = 6176.0;
pub const CELL_SIZE: f32 = 350.0;

// Per-agent observation dimensions.
pub const SELF_DIM: usize = 77;
pub const ALLY_DIM: usize = 37;
pub const ENEMY_DIM: usize = 43;
pub const GLOBAL_DIM: usize = 6;
/// LSTM hidden width of the policy.
pub const HIDDEN_DIM: usize = 256;

/// Normalization divisors applied by the state encoder.
pub mod norm {
    pub const HP: f32 = 10_000.0;
    pub const MP: f32 = 5_000.0;
    pub const XY: f32 = 10_000.0;
    pub const STAT: f32 = 200.0;
    pub const ATK: f32 = 500.0;
    pub const DEF: f32 = 50.0;
    pub const MOVE_SPD: f32 = 522.0;
    pub const LEVEL: f32 = 25.0;
    pub const CD: f32 = 120.0;
    pub const FAIRE: f32 = 16_000.0;
    pub const SCORE: f32 = 70.0;
    pub const GAME_TIME: f32 = 1_800.0;
}

/// Hero ids in player-slot order: slots 0-5 are team 0, slots 6-11 team 1.
pub const HERO_IDS: [&[u8; 4]; NUM_UNITS] = [
    b"H000", b"H001", b"H002", b"H03M", b"H028", b"H009", // team 0
    b"H007", b"H005", b"H003", b"H006", b"H004", b"H008", // team 1
];

/// Map a four-byte hero id to its slot index. Unknown ids fall back to 0.
pub fn hero_index(hero_id: &[u8; 4]) -> usize {
    HERO_IDS.iter().position(|h| *h == hero_id).unwrap_or(0)
}

/// One discrete action head of the policy.
#[derive(Debug, Clone, Copy)]
pub struct HeadSpec {
    pub name: &'static str,
    pub arity: usize,
}

pub const NUM_DISCRETE_HEADS: usize = 11;

/// The eleven discrete heads in canonical order. This order is load-bearing:
/// it is the model forward signature, the mask tensor order, and the wire
/// layout of the ACTION packet.
pub const DISCRETE_HEADS: [HeadSpec; NUM_DISCRETE_HEADS] = [
    HeadSpec { name: "skill", arity: 8 },
    HeadSpec { name: "unit_target", arity: 14 },
    HeadSpec { name: "skill_levelup", arity: 6 },
    HeadSpec { name: "stat_upgrade", arity: 10 },
    HeadSpec { name: "attribute", arity: 5 },
    HeadSpec { name: "item_buy", arity: 17 },
    HeadSpec { name: "item_use", arity: 7 },
    HeadSpec { name: "seal_use", arity: 7 },
    HeadSpec { name: "faire_send", arity: 6 },
    HeadSpec { name: "faire_request", arity: 6 },
    HeadSpec { name: "faire_respond", arity: 3 },
];

/// Index of the unit_target head, which needs sorted-enemy remapping.
pub const UNIT_TARGET_HEAD: usize = 1;

/// Reward shaping constants, OpenAI Five style.
pub mod reward {
    pub const KILL_PERSONAL: f32 = 3.0;
    pub const DEATH: f32 = -1.0;
    pub const CREEP: f32 = 0.16;
    pub const LEVELUP: f32 = 0.5;
    pub const FRIENDLY_KILL: f32 = -3.0;
    pub const SCORE_POINT: f32 = 2.0;

    pub const SKILL_POINTS_HELD: f32 = -0.02;
    pub const IDLE_PENALTY: f32 = -0.003;
    /// Movement below this many world units per tick counts as idle.
    pub const IDLE_DISTANCE: f32 = 10.0;

    pub const WIN: f32 = 10.0;
    pub const LOSE: f32 = -5.0;
    pub const TIMEOUT: f32 = -2.0;

    /// τ in `τ·team_mean + (1−τ)·individual`.
    pub const TEAM_SPIRIT: f32 = 0.5;

    pub const TIME_DECAY_BASE: f32 = 0.7;
    pub const TIME_DECAY_INTERVAL: f32 = 600.0;
}

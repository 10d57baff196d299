//! Binary wire protocol: STATE / ACTION / DONE packets.
//!
//! The game client writes tightly packed little-endian structs; nothing here
//! relies on `repr(C)` casts: every field is read and written explicitly
//! through a byte cursor, and the layout sizes are asserted in tests.

use std::error::Error;
use std::fmt;

use crate::constants::{GRID_CELLS, MAX_EVENTS, NUM_DISCRETE_HEADS, NUM_UNITS};

pub const MAGIC: u16 = 0xFA7E;
pub const PROTO_VERSION: u8 = 1;

pub const HEADER_SIZE: usize = 8;
pub const SKILL_SLOT_SIZE: usize = 14;
pub const ITEM_SLOT_SIZE: usize = 4;
pub const UNIT_STATE_SIZE: usize = 231;
pub const GLOBAL_STATE_SIZE: usize = 28;
pub const EVENT_SIZE: usize = 8;
/// Header + global + 12 units + num_events byte.
pub const STATE_FIXED_SIZE: usize =
    HEADER_SIZE + GLOBAL_STATE_SIZE + NUM_UNITS * UNIT_STATE_SIZE + 1;
pub const UNIT_ACTION_SIZE: usize = 30;
pub const ACTION_PACKET_SIZE: usize = HEADER_SIZE + NUM_UNITS * UNIT_ACTION_SIZE;
pub const DONE_PACKET_SIZE: usize = 16;

// ============================================================
// Errors
// ============================================================

/// Codec failure. `Malformed` is a length shortfall in an otherwise accepted
/// packet; `Rejected` is a packet we refuse outright (magic/version/type).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    Malformed(&'static str),
    Rejected(&'static str),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketError::Malformed(what) => write!(f, "malformed packet: {}", what),
            PacketError::Rejected(what) => write!(f, "rejected packet: {}", what),
        }
    }
}

impl Error for PacketError {}

// ============================================================
// Header
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    State = 1,
    Action = 2,
    Done = 3,
}

impl MsgType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MsgType::State),
            2 => Some(MsgType::Action),
            3 => Some(MsgType::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub msg_type: MsgType,
    pub tick: u32,
}

/// Validate and decode the 8-byte header. Used both by the codec and by the
/// orchestrator's classification pass.
pub fn parse_header(data: &[u8]) -> Result<PacketHeader, PacketError> {
    if data.len() < HEADER_SIZE {
        return Err(PacketError::Malformed("truncated header"));
    }
    let magic = u16::from_le_bytes([data[0], data[1]]);
    if magic != MAGIC {
        return Err(PacketError::Rejected("bad magic"));
    }
    if data[2] != PROTO_VERSION {
        return Err(PacketError::Rejected("bad version"));
    }
    let msg_type =
        MsgType::from_u8(data[3]).ok_or(PacketError::Rejected("unknown message type"))?;
    let tick = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    Ok(PacketHeader { msg_type, tick })
}

// ============================================================
// STATE payload structs
// ============================================================

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SkillSlot {
    pub abil_id: i32,
    pub level: u8,
    pub cd_remain: f32,
    pub cd_max: f32,
    pub exists: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ItemSlot {
    pub type_id: i16,
    pub charges: u8,
}

/// One hero's full per-tick snapshot, ~231 packed bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitState {
    pub idx: u8,
    pub hero_id: [u8; 4],
    pub team: u8,

    pub hp: f32,
    pub max_hp: f32,
    pub mp: f32,
    pub max_mp: f32,
    pub x: f32,
    pub y: f32,
    pub vel_x: f32,
    pub vel_y: f32,
    pub alive: u8,
    pub revive_remain: f32,

    pub str_: i16,
    pub agi: i16,
    pub int_: i16,
    pub atk: f32,
    pub def_: f32,
    pub move_spd: f32,
    pub atk_range: f32,
    pub atk_spd: f32,

    pub level: u8,
    pub skill_points: u8,
    pub stat_points: u8,
    pub xp: i32,

    pub skills: [SkillSlot; 6],
    pub upgrades: [u8; 9],
    /// Bits 0-3: attributes A-D.
    pub attributes: u8,
    /// Bits 0-5: stun|slow|silence|knockback|root|invuln.
    pub buffs: u8,

    pub seal_charges: u8,
    pub seal_cd: i16,
    pub seal_first_active: u8,
    pub seal_first_remain: f32,

    pub items: [ItemSlot; 6],

    pub faire: i32,
    pub faire_cap: i16,

    pub enemy_alarm: u8,
    /// Bit i set ⇒ this unit is visible to player i.
    pub visible_mask: u16,

    pub mask_skill: u8,
    pub mask_unit_target: u16,
    pub mask_skill_levelup: u8,
    pub mask_stat_upgrade: u16,
    pub mask_attribute: u8,
    pub mask_item_buy: u32,
    pub mask_item_use: u8,
    pub mask_seal_use: u8,
    pub mask_faire_send: u8,
    pub mask_faire_request: u8,
    pub mask_faire_respond: u8,
}

impl Default for UnitState {
    fn default() -> Self {
        UnitState {
            idx: 0,
            hero_id: [0; 4],
            team: 0,
            hp: 0.0,
            max_hp: 0.0,
            mp: 0.0,
            max_mp: 0.0,
            x: 0.0,
            y: 0.0,
            vel_x: 0.0,
            vel_y: 0.0,
            alive: 0,
            revive_remain: 0.0,
            str_: 0,
            agi: 0,
            int_: 0,
            atk: 0.0,
            def_: 0.0,
            move_spd: 0.0,
            atk_range: 0.0,
            atk_spd: 0.0,
            level: 0,
            skill_points: 0,
            stat_points: 0,
            xp: 0,
            skills: [SkillSlot::default(); 6],
            upgrades: [0; 9],
            attributes: 0,
            buffs: 0,
            seal_charges: 0,
            seal_cd: 0,
            seal_first_active: 0,
            seal_first_remain: 0.0,
            items: [ItemSlot::default(); 6],
            faire: 0,
            faire_cap: 0,
            enemy_alarm: 0,
            visible_mask: 0,
            mask_skill: 0,
            mask_unit_target: 0,
            mask_skill_levelup: 0,
            mask_stat_upgrade: 0,
            mask_attribute: 0,
            mask_item_buy: 0,
            mask_item_use: 0,
            mask_seal_use: 0,
            mask_faire_send: 0,
            mask_faire_request: 0,
            mask_faire_respond: 0,
        }
    }
}

impl UnitState {
    /// Packed availability bits for one discrete head, widened to u32.
    pub fn mask_field(&self, head: usize) -> u32 {
        match head {
            0 => self.mask_skill as u32,
            1 => self.mask_unit_target as u32,
            2 => self.mask_skill_levelup as u32,
            3 => self.mask_stat_upgrade as u32,
            4 => self.mask_attribute as u32,
            5 => self.mask_item_buy,
            6 => self.mask_item_use as u32,
            7 => self.mask_seal_use as u32,
            8 => self.mask_faire_send as u32,
            9 => self.mask_faire_request as u32,
            10 => self.mask_faire_respond as u32,
            _ => 0,
        }
    }

    pub fn mask_bit(&self, head: usize, bit: usize) -> bool {
        debug_assert!(head < NUM_DISCRETE_HEADS);
        (self.mask_field(head) >> bit) & 1 == 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GlobalState {
    pub game_time: f32,
    pub time_of_day: f32,
    pub next_point_time: f32,
    pub is_night: u8,
    pub score_team0: i16,
    pub score_team1: i16,
    pub target_score: i16,
    pub c_rank_stock: i16,
    pub reserved: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Kill = 1,
    CreepKill = 2,
    LevelUp = 3,
}

/// Tick-stamped game event. For `LevelUp` the "killer" byte carries the unit
/// index and the "victim" byte the new level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameEvent {
    pub kind: EventKind,
    pub killer_idx: u8,
    pub victim_idx: u8,
    pub tick: u32,
}

/// Fully parsed STATE packet.
#[derive(Debug, Clone)]
pub struct StatePacket {
    pub tick: u32,
    pub global: GlobalState,
    pub units: [UnitState; NUM_UNITS],
    pub events: Vec<GameEvent>,
    /// 1200-byte plane, absent when the client skipped it this tick.
    pub pathability: Option<Vec<u8>>,
    pub visibility_t0: Vec<u8>,
    pub visibility_t1: Vec<u8>,
}

// ============================================================
// Byte cursor
// ============================================================

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], PacketError> {
        if self.pos + n > self.data.len() {
            return Err(PacketError::Malformed(what));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, PacketError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, PacketError> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i16(&mut self, what: &'static str) -> Result<i16, PacketError> {
        let b = self.take(2, what)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, PacketError> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self, what: &'static str) -> Result<i32, PacketError> {
        let b = self.take(4, what)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32(&mut self, what: &'static str) -> Result<f32, PacketError> {
        let b = self.take(4, what)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

fn read_skill_slot(r: &mut Reader) -> Result<SkillSlot, PacketError> {
    Ok(SkillSlot {
        abil_id: r.i32("skill slot")?,
        level: r.u8("skill slot")?,
        cd_remain: r.f32("skill slot")?,
        cd_max: r.f32("skill slot")?,
        exists: r.u8("skill slot")?,
    })
}

fn read_item_slot(r: &mut Reader) -> Result<ItemSlot, PacketError> {
    let slot = ItemSlot {
        type_id: r.i16("item slot")?,
        charges: r.u8("item slot")?,
    };
    r.u8("item slot")?; // padding
    Ok(slot)
}

fn read_unit(r: &mut Reader) -> Result<UnitState, PacketError> {
    let mut u = UnitState {
        idx: r.u8("unit")?,
        ..UnitState::default()
    };
    let hero = r.take(4, "unit")?;
    u.hero_id.copy_from_slice(hero);
    u.team = r.u8("unit")?;

    u.hp = r.f32("unit")?;
    u.max_hp = r.f32("unit")?;
    u.mp = r.f32("unit")?;
    u.max_mp = r.f32("unit")?;
    u.x = r.f32("unit")?;
    u.y = r.f32("unit")?;
    u.vel_x = r.f32("unit")?;
    u.vel_y = r.f32("unit")?;
    u.alive = r.u8("unit")?;
    u.revive_remain = r.f32("unit")?;

    u.str_ = r.i16("unit")?;
    u.agi = r.i16("unit")?;
    u.int_ = r.i16("unit")?;
    u.atk = r.f32("unit")?;
    u.def_ = r.f32("unit")?;
    u.move_spd = r.f32("unit")?;
    u.atk_range = r.f32("unit")?;
    u.atk_spd = r.f32("unit")?;

    u.level = r.u8("unit")?;
    u.skill_points = r.u8("unit")?;
    u.stat_points = r.u8("unit")?;
    r.u8("unit")?; // _pad_prog
    u.xp = r.i32("unit")?;

    for slot in u.skills.iter_mut() {
        *slot = read_skill_slot(r)?;
    }
    let upgrades = r.take(9, "unit")?;
    u.upgrades.copy_from_slice(upgrades);
    u.attributes = r.u8("unit")?;
    u.buffs = r.u8("unit")?;

    u.seal_charges = r.u8("unit")?;
    u.seal_cd = r.i16("unit")?;
    u.seal_first_active = r.u8("unit")?;
    u.seal_first_remain = r.f32("unit")?;

    for slot in u.items.iter_mut() {
        *slot = read_item_slot(r)?;
    }

    u.faire = r.i32("unit")?;
    u.faire_cap = r.i16("unit")?;
    r.take(2, "unit")?; // _pad_econ

    u.enemy_alarm = r.u8("unit")?;
    u.visible_mask = r.u16("unit")?;

    u.mask_skill = r.u8("unit")?;
    u.mask_unit_target = r.u16("unit")?;
    u.mask_skill_levelup = r.u8("unit")?;
    u.mask_stat_upgrade = r.u16("unit")?;
    u.mask_attribute = r.u8("unit")?;
    u.mask_item_buy = r.u32("unit")?;
    u.mask_item_use = r.u8("unit")?;
    u.mask_seal_use = r.u8("unit")?;
    u.mask_faire_send = r.u8("unit")?;
    u.mask_faire_request = r.u8("unit")?;
    u.mask_faire_respond = r.u8("unit")?;

    Ok(u)
}

fn read_global(r: &mut Reader) -> Result<GlobalState, PacketError> {
    let mut g = GlobalState {
        game_time: r.f32("global")?,
        time_of_day: r.f32("global")?,
        next_point_time: r.f32("global")?,
        is_night: r.u8("global")?,
        ..GlobalState::default()
    };
    r.take(3, "global")?; // _pad_global
    g.score_team0 = r.i16("global")?;
    g.score_team1 = r.i16("global")?;
    g.target_score = r.i16("global")?;
    g.c_rank_stock = r.i16("global")?;
    g.reserved = r.f32("global")?;
    Ok(g)
}

fn read_event(r: &mut Reader) -> Result<Option<GameEvent>, PacketError> {
    let kind_byte = r.u8("event")?;
    let killer_idx = r.u8("event")?;
    let victim_idx = r.u8("event")?;
    r.u8("event")?; // padding
    let tick = r.u32("event")?;
    let kind = match kind_byte {
        1 => EventKind::Kill,
        2 => EventKind::CreepKill,
        3 => EventKind::LevelUp,
        _ => return Ok(None), // unknown event kind, skip
    };
    Ok(Some(GameEvent {
        kind,
        killer_idx,
        victim_idx,
        tick,
    }))
}

// ============================================================
// STATE parse
// ============================================================

/// Decode a STATE datagram. `Rejected` for bad magic/version/type,
/// `Malformed` for any length shortfall.
pub fn parse_state(data: &[u8]) -> Result<StatePacket, PacketError> {
    let header = parse_header(data)?;
    if header.msg_type != MsgType::State {
        return Err(PacketError::Rejected("not a STATE packet"));
    }

    let mut r = Reader::new(data);
    r.pos = HEADER_SIZE;

    let global = read_global(&mut r)?;

    let mut units = [UnitState::default(); NUM_UNITS];
    for unit in units.iter_mut() {
        *unit = read_unit(&mut r)?;
    }

    let num_events = (r.u8("num_events")? as usize).min(MAX_EVENTS);
    let mut events = Vec::with_capacity(num_events);
    for _ in 0..num_events {
        if let Some(ev) = read_event(&mut r)? {
            events.push(ev);
        }
    }

    let has_pathability = r.u8("has_pathability")?;
    let pathability = if has_pathability != 0 {
        Some(r.take(GRID_CELLS, "pathability plane")?.to_vec())
    } else {
        None
    };

    let visibility_t0 = r.take(GRID_CELLS, "visibility plane t0")?.to_vec();
    let visibility_t1 = r.take(GRID_CELLS, "visibility plane t1")?.to_vec();

    Ok(StatePacket {
        tick: header.tick,
        global,
        units,
        events,
        pathability,
        visibility_t0,
        visibility_t1,
    })
}

// ============================================================
// DONE parse
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DonePacket {
    pub tick: u32,
    /// 0 = team 0 won, 1 = team 1 won, 2 = draw.
    pub winner: u8,
    /// 1 = team wipe, 2 = timeout, 3 = score.
    pub reason: u8,
    pub score_team0: i16,
    pub score_team1: i16,
}

pub fn parse_done(data: &[u8]) -> Result<DonePacket, PacketError> {
    let header = parse_header(data)?;
    if header.msg_type != MsgType::Done {
        return Err(PacketError::Rejected("not a DONE packet"));
    }
    if data.len() < DONE_PACKET_SIZE {
        return Err(PacketError::Malformed("truncated DONE"));
    }
    let mut r = Reader::new(data);
    r.pos = HEADER_SIZE;
    let winner = r.u8("done")?;
    let reason = r.u8("done")?;
    let score_team0 = r.i16("done")?;
    let score_team1 = r.i16("done")?;
    Ok(DonePacket {
        tick: header.tick,
        winner,
        reason,
        score_team0,
        score_team1,
    })
}

// ============================================================
// ACTION emit
// ============================================================

/// One hero's action record. `discrete` follows the canonical head order of
/// [`crate::constants::DISCRETE_HEADS`]; `unit_target` must already be in
/// real enemy coordinates when this is emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UnitAction {
    pub move_x: f32,
    pub move_y: f32,
    pub point_x: f32,
    pub point_y: f32,
    pub discrete: [u8; NUM_DISCRETE_HEADS],
}

fn push_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_header(out: &mut Vec<u8>, msg_type: MsgType, tick: u32) {
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.push(PROTO_VERSION);
    out.push(msg_type as u8);
    out.extend_from_slice(&tick.to_le_bytes());
}

fn clamp_unit(v: f32) -> f32 {
    v.clamp(-1.0, 1.0)
}

/// Serialize an ACTION packet: header plus twelve fixed-size action records.
/// `move`/`point` are clamped to [-1, 1] here so the wire never carries an
/// out-of-range sample.
pub fn encode_action(tick: u32, actions: &[UnitAction; NUM_UNITS]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ACTION_PACKET_SIZE);
    write_header(&mut out, MsgType::Action, tick);

    for (i, action) in actions.iter().enumerate() {
        out.push(i as u8);
        out.push(0); // _pad
        push_f32(&mut out, clamp_unit(action.move_x));
        push_f32(&mut out, clamp_unit(action.move_y));
        push_f32(&mut out, clamp_unit(action.point_x));
        push_f32(&mut out, clamp_unit(action.point_y));
        out.extend_from_slice(&action.discrete);
        out.push(0); // _pad2
    }

    debug_assert_eq!(out.len(), ACTION_PACKET_SIZE);
    out
}

/// Decode an ACTION packet. The server never receives these; the decoder
/// exists for round-trip verification and test clients.
pub fn parse_action(data: &[u8]) -> Result<(u32, [UnitAction; NUM_UNITS]), PacketError> {
    let header = parse_header(data)?;
    if header.msg_type != MsgType::Action {
        return Err(PacketError::Rejected("not an ACTION packet"));
    }
    let mut r = Reader::new(data);
    r.pos = HEADER_SIZE;

    let mut actions = [UnitAction::default(); NUM_UNITS];
    for action in actions.iter_mut() {
        r.u8("action")?; // idx
        r.u8("action")?; // _pad
        action.move_x = r.f32("action")?;
        action.move_y = r.f32("action")?;
        action.point_x = r.f32("action")?;
        action.point_y = r.f32("action")?;
        for d in action.discrete.iter_mut() {
            *d = r.u8("action")?;
        }
        r.u8("action")?; // _pad2
    }
    Ok((header.tick, actions))
}

// ============================================================
// STATE emit, used by tests and test clients to pack reference structs
// ============================================================

fn write_skill_slot(out: &mut Vec<u8>, s: &SkillSlot) {
    out.extend_from_slice(&s.abil_id.to_le_bytes());
    out.push(s.level);
    push_f32(out, s.cd_remain);
    push_f32(out, s.cd_max);
    out.push(s.exists);
}

fn write_item_slot(out: &mut Vec<u8>, s: &ItemSlot) {
    out.extend_from_slice(&s.type_id.to_le_bytes());
    out.push(s.charges);
    out.push(0);
}

fn write_unit(out: &mut Vec<u8>, u: &UnitState) {
    out.push(u.idx);
    out.extend_from_slice(&u.hero_id);
    out.push(u.team);

    push_f32(out, u.hp);
    push_f32(out, u.max_hp);
    push_f32(out, u.mp);
    push_f32(out, u.max_mp);
    push_f32(out, u.x);
    push_f32(out, u.y);
    push_f32(out, u.vel_x);
    push_f32(out, u.vel_y);
    out.push(u.alive);
    push_f32(out, u.revive_remain);

    out.extend_from_slice(&u.str_.to_le_bytes());
    out.extend_from_slice(&u.agi.to_le_bytes());
    out.extend_from_slice(&u.int_.to_le_bytes());
    push_f32(out, u.atk);
    push_f32(out, u.def_);
    push_f32(out, u.move_spd);
    push_f32(out, u.atk_range);
    push_f32(out, u.atk_spd);

    out.push(u.level);
    out.push(u.skill_points);
    out.push(u.stat_points);
    out.push(0); // _pad_prog
    out.extend_from_slice(&u.xp.to_le_bytes());

    for slot in &u.skills {
        write_skill_slot(out, slot);
    }
    out.extend_from_slice(&u.upgrades);
    out.push(u.attributes);
    out.push(u.buffs);

    out.push(u.seal_charges);
    out.extend_from_slice(&u.seal_cd.to_le_bytes());
    out.push(u.seal_first_active);
    push_f32(out, u.seal_first_remain);

    for slot in &u.items {
        write_item_slot(out, slot);
    }

    out.extend_from_slice(&u.faire.to_le_bytes());
    out.extend_from_slice(&u.faire_cap.to_le_bytes());
    out.extend_from_slice(&[0, 0]); // _pad_econ

    out.push(u.enemy_alarm);
    out.extend_from_slice(&u.visible_mask.to_le_bytes());

    out.push(u.mask_skill);
    out.extend_from_slice(&u.mask_unit_target.to_le_bytes());
    out.push(u.mask_skill_levelup);
    out.extend_from_slice(&u.mask_stat_upgrade.to_le_bytes());
    out.push(u.mask_attribute);
    out.extend_from_slice(&u.mask_item_buy.to_le_bytes());
    out.push(u.mask_item_use);
    out.push(u.mask_seal_use);
    out.push(u.mask_faire_send);
    out.push(u.mask_faire_request);
    out.push(u.mask_faire_respond);
}

fn write_global(out: &mut Vec<u8>, g: &GlobalState) {
    push_f32(out, g.game_time);
    push_f32(out, g.time_of_day);
    push_f32(out, g.next_point_time);
    out.push(g.is_night);
    out.extend_from_slice(&[0, 0, 0]); // _pad_global
    out.extend_from_slice(&g.score_team0.to_le_bytes());
    out.extend_from_slice(&g.score_team1.to_le_bytes());
    out.extend_from_slice(&g.target_score.to_le_bytes());
    out.extend_from_slice(&g.c_rank_stock.to_le_bytes());
    push_f32(out, g.reserved);
}

fn write_event(out: &mut Vec<u8>, ev: &GameEvent) {
    out.push(ev.kind as u8);
    out.push(ev.killer_idx);
    out.push(ev.victim_idx);
    out.push(0); // padding
    out.extend_from_slice(&ev.tick.to_le_bytes());
}

/// Pack a STATE packet, the mirror image of [`parse_state`].
pub fn encode_state(pkt: &StatePacket) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        STATE_FIXED_SIZE + pkt.events.len() * EVENT_SIZE + 1 + 3 * GRID_CELLS,
    );
    write_header(&mut out, MsgType::State, pkt.tick);
    write_global(&mut out, &pkt.global);
    for unit in &pkt.units {
        write_unit(&mut out, unit);
    }
    out.push(pkt.events.len() as u8);
    for ev in &pkt.events {
        write_event(&mut out, ev);
    }
    match &pkt.pathability {
        Some(plane) => {
            out.push(1);
            out.extend_from_slice(plane);
        }
        None => out.push(0),
    }
    out.extend_from_slice(&pkt.visibility_t0);
    out.extend_from_slice(&pkt.visibility_t1);
    out
}

/// Pack a DONE packet (test clients only).
pub fn encode_done(pkt: &DonePacket) -> Vec<u8> {
    let mut out = Vec::with_capacity(DONE_PACKET_SIZE);
    write_header(&mut out, MsgType::Done, pkt.tick);
    out.push(pkt.winner);
    out.push(pkt.reason);
    out.extend_from_slice(&pkt.score_team0.to_le_bytes());
    out.extend_from_slice(&pkt.score_team1.to_le_bytes());
    out.extend_from_slice(&[0, 0]); // _pad
    out
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_unit(idx: u8) -> UnitState {
        let mut u = UnitState {
            idx,
            hero_id: *crate::constants::HERO_IDS[idx as usize],
            team: if idx < 6 { 0 } else { 1 },
            hp: 5400.0,
            max_hp: 6000.0,
            mp: 900.0,
            max_mp: 1200.0,
            x: -2000.0 + idx as f32 * 300.0,
            y: 1000.0,
            vel_x: 120.0,
            vel_y: -60.0,
            alive: 1,
            revive_remain: 0.0,
            str_: 44,
            agi: 31,
            int_: 27,
            atk: 180.0,
            def_: 12.0,
            move_spd: 320.0,
            atk_range: 128.0,
            atk_spd: 1.4,
            level: 9,
            skill_points: 1,
            stat_points: 20,
            xp: 12_400,
            seal_charges: 3,
            seal_cd: 12,
            seal_first_active: 1,
            seal_first_remain: 8.5,
            faire: 4200,
            faire_cap: 16_000,
            enemy_alarm: 0,
            visible_mask: 0x0FFF,
            mask_skill: 0b1010_1010,
            mask_unit_target: 0x3FFF,
            mask_skill_levelup: 0b10_1010,
            mask_stat_upgrade: 0x03FF,
            mask_attribute: 0b1_0101,
            mask_item_buy: 0x0001_FFFF,
            mask_item_use: 0b101_0101,
            mask_seal_use: 0b010_1010,
            mask_faire_send: 0b11_0011,
            mask_faire_request: 0b00_1100,
            mask_faire_respond: 0b101,
            ..UnitState::default()
        };
        u.skills[0] = SkillSlot {
            abil_id: 0x4130_3030,
            level: 3,
            cd_remain: 2.5,
            cd_max: 12.0,
            exists: 1,
        };
        u.upgrades = [1, 2, 3, 4, 5, 6, 7, 8, 9];
        u.attributes = 0b1001;
        u.buffs = 0b10_0001;
        u.items[2] = ItemSlot {
            type_id: 7,
            charges: 2,
        };
        u
    }

    fn sample_state(tick: u32) -> StatePacket {
        let mut units = [UnitState::default(); NUM_UNITS];
        for (i, unit) in units.iter_mut().enumerate() {
            *unit = sample_unit(i as u8);
        }
        StatePacket {
            tick,
            global: GlobalState {
                game_time: 423.5,
                time_of_day: 0.25,
                next_point_time: 450.0,
                is_night: 1,
                score_team0: 12,
                score_team1: 8,
                target_score: 70,
                c_rank_stock: 6,
                reserved: 0.0,
            },
            units,
            events: vec![
                GameEvent {
                    kind: EventKind::Kill,
                    killer_idx: 0,
                    victim_idx: 6,
                    tick,
                },
                GameEvent {
                    kind: EventKind::LevelUp,
                    killer_idx: 3,
                    victim_idx: 10,
                    tick,
                },
            ],
            pathability: Some((0..GRID_CELLS).map(|i| (i % 3) as u8).collect()),
            visibility_t0: vec![1; GRID_CELLS],
            visibility_t1: vec![0; GRID_CELLS],
        }
    }

    #[test]
    fn layout_sizes() {
        // Must track the packed reference layout byte for byte.
        assert_eq!(STATE_FIXED_SIZE, 2809);
        assert_eq!(ACTION_PACKET_SIZE, 368);
        let one_unit = {
            let mut buf = Vec::new();
            write_unit(&mut buf, &UnitState::default());
            buf.len()
        };
        assert_eq!(one_unit, UNIT_STATE_SIZE);
        let global = {
            let mut buf = Vec::new();
            write_global(&mut buf, &GlobalState::default());
            buf.len()
        };
        assert_eq!(global, GLOBAL_STATE_SIZE);
        let slot = {
            let mut buf = Vec::new();
            write_skill_slot(&mut buf, &SkillSlot::default());
            buf.len()
        };
        assert_eq!(slot, SKILL_SLOT_SIZE);
        let item = {
            let mut buf = Vec::new();
            write_item_slot(&mut buf, &ItemSlot::default());
            buf.len()
        };
        assert_eq!(item, ITEM_SLOT_SIZE);
    }

    #[test]
    fn state_round_trip() {
        let pkt = sample_state(77);
        let bytes = encode_state(&pkt);
        let parsed = parse_state(&bytes).unwrap();

        assert_eq!(parsed.tick, 77);
        assert_eq!(parsed.global, pkt.global);
        assert_eq!(parsed.units[..], pkt.units[..]);
        assert_eq!(parsed.events, pkt.events);
        assert_eq!(parsed.pathability, pkt.pathability);
        assert_eq!(parsed.visibility_t0, pkt.visibility_t0);
        assert_eq!(parsed.visibility_t1, pkt.visibility_t1);
    }

    #[test]
    fn state_without_pathability() {
        let mut pkt = sample_state(3);
        pkt.pathability = None;
        let bytes = encode_state(&pkt);
        let parsed = parse_state(&bytes).unwrap();
        assert!(parsed.pathability.is_none());
        assert_eq!(parsed.visibility_t0.len(), GRID_CELLS);
    }

    #[test]
    fn action_round_trip() {
        let mut actions = [UnitAction::default(); NUM_UNITS];
        for (i, a) in actions.iter_mut().enumerate() {
            a.move_x = -0.5 + i as f32 * 0.1;
            a.move_y = 0.25;
            a.point_x = 0.9;
            a.point_y = -0.9;
            for (h, d) in a.discrete.iter_mut().enumerate() {
                *d = ((i + h) % 3) as u8;
            }
        }
        let bytes = encode_action(41, &actions);
        assert_eq!(bytes.len(), ACTION_PACKET_SIZE);

        let (tick, decoded) = parse_action(&bytes).unwrap();
        assert_eq!(tick, 41);
        assert_eq!(decoded, actions);
    }

    #[test]
    fn action_clamps_continuous() {
        let mut actions = [UnitAction::default(); NUM_UNITS];
        actions[0].move_x = 3.7;
        actions[0].point_y = -42.0;
        let bytes = encode_action(1, &actions);
        let (_, decoded) = parse_action(&bytes).unwrap();
        assert_eq!(decoded[0].move_x, 1.0);
        assert_eq!(decoded[0].point_y, -1.0);
    }

    #[test]
    fn done_round_trip() {
        let pkt = DonePacket {
            tick: 9001,
            winner: 0,
            reason: 3,
            score_team0: 70,
            score_team1: 42,
        };
        let bytes = encode_done(&pkt);
        assert_eq!(bytes.len(), DONE_PACKET_SIZE);
        assert_eq!(parse_done(&bytes).unwrap(), pkt);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let pkt = sample_state(1);
        let mut bytes = encode_state(&pkt);
        bytes[0] = 0x00;
        assert!(matches!(
            parse_state(&bytes),
            Err(PacketError::Rejected("bad magic"))
        ));

        let mut bytes = encode_state(&pkt);
        bytes[2] = 9;
        assert!(matches!(
            parse_state(&bytes),
            Err(PacketError::Rejected("bad version"))
        ));
    }

    #[test]
    fn truncation_is_malformed() {
        let bytes = encode_state(&sample_state(1));
        // Cut inside the unit block
        assert!(matches!(
            parse_state(&bytes[..500]),
            Err(PacketError::Malformed(_))
        ));
        // Cut inside the trailing visibility plane
        assert!(matches!(
            parse_state(&bytes[..bytes.len() - 10]),
            Err(PacketError::Malformed(_))
        ));
        // Header-only fragment
        assert!(matches!(
            parse_state(&bytes[..4]),
            Err(PacketError::Malformed(_))
        ));
    }

    #[test]
    fn event_cap_truncates_silently() {
        let mut pkt = sample_state(5);
        pkt.events = (0..MAX_EVENTS + 4)
            .map(|i| GameEvent {
                kind: EventKind::CreepKill,
                killer_idx: (i % 12) as u8,
                victim_idx: 0,
                tick: 5,
            })
            .collect();
        // Hand-pack with an oversized count byte: the parser clamps to
        // MAX_EVENTS records and resumes right after them.
        let mut bytes = Vec::new();
        write_header(&mut bytes, MsgType::State, pkt.tick);
        write_global(&mut bytes, &pkt.global);
        for unit in &pkt.units {
            write_unit(&mut bytes, unit);
        }
        bytes.push((MAX_EVENTS + 4) as u8); // count overstates the records sent
        for ev in &pkt.events[..MAX_EVENTS] {
            write_event(&mut bytes, ev);
        }
        bytes.push(0);
        bytes.extend_from_slice(&pkt.visibility_t0);
        bytes.extend_from_slice(&pkt.visibility_t1);

        let parsed = parse_state(&bytes).unwrap();
        assert_eq!(parsed.events.len(), MAX_EVENTS);
    }
}

//! Standard Schemas
//!
//! The session, player, command-input, entity and inventory-item layouts
//! shared by the server and client loops, plus pre-resolved [`FieldId`]s so
//! hot paths never look fields up by name.
//!
//! Trust layout of a player:
//!
//! ```text
//! client_stamp      checked     (tick/time the client believes)
//! server_stamp      server-only (tick/time the server tracks for it)
//! localized_stamp   local-only  (client clock estimate)
//! move              checked, position/velocity within 0.01
//! camera            client-trusted
//! health, team,
//! respawn, stats,
//! username          server-only
//! equipped slot     client-trusted
//! inventory items   server-only
//! ping, initial     local-only  (server bookkeeping)
//! ```

use std::sync::Arc;

use crate::core::schema::{FieldId, Interpolation, Schema, SchemaBuilder, Trust};
use crate::core::snapshot::{FieldRead, FieldWrite, SnapshotMut, SnapshotRef};
use crate::core::value::{FieldKind, Value};

/// Full health on (re)spawn.
pub const MAX_HEALTH: u8 = 100;

/// Inventory slots per player.
pub const INVENTORY_SLOTS: u16 = 4;

/// Item id of a throwable grenade.
pub const ITEM_GRENADE: u8 = 1;

/// Entity kind of a thrown grenade.
pub const ENTITY_GRENADE: u8 = 1;

/// Longest accepted username in bytes.
pub const MAX_USERNAME_LEN: usize = 24;

// =============================================================================
// IDS
// =============================================================================

/// Ids inside a stamp component.
#[derive(Clone, Copy, Debug)]
pub struct StampIds {
    /// The component itself
    pub root: FieldId,
    /// Tick number
    pub tick: FieldId,
    /// Absolute time (us)
    pub time_us: FieldId,
    /// Step duration (us)
    pub duration_us: FieldId,
}

impl StampIds {
    fn resolve(schema: &Schema, prefix: &str) -> Self {
        Self {
            root: schema.id(prefix),
            tick: schema.id(&format!("{prefix}.tick")),
            time_us: schema.id(&format!("{prefix}.time_us")),
            duration_us: schema.id(&format!("{prefix}.duration_us")),
        }
    }
}

/// Ids inside a player snapshot (also valid on session player elements).
#[derive(Clone, Copy, Debug)]
pub struct PlayerIds {
    /// Client-authored stamp
    pub client_stamp: StampIds,
    /// Server-authored stamp; `time_us` is the server-tracked player time
    pub server_stamp: StampIds,
    /// Client-side estimate of when the server stamp happened
    pub localized_time_us: FieldId,
    /// Position
    pub position: FieldId,
    /// Velocity
    pub velocity: FieldId,
    /// Ticks spent on the ground (saturating)
    pub ground_tick: FieldId,
    /// Walk-cycle phase in `[0, 1)`
    pub normalized_move: FieldId,
    /// Camera component
    pub camera: FieldId,
    /// Camera yaw in degrees
    pub yaw: FieldId,
    /// Camera pitch in degrees
    pub pitch: FieldId,
    /// Health (absent = slot not joined)
    pub health: FieldId,
    /// Damage taken this tick
    pub took_damage: FieldId,
    /// Time until respawn (us)
    pub respawn_timer_us: FieldId,
    /// Team
    pub team: FieldId,
    /// Kills
    pub kills: FieldId,
    /// Deaths
    pub deaths: FieldId,
    /// Damage dealt
    pub damage: FieldId,
    /// Displayed ping (ms)
    pub ping_ms: FieldId,
    /// Equipped inventory slot
    pub equipped_index: FieldId,
    /// Inventory item array
    pub items: FieldId,
    /// Round-trip time (us)
    pub rtt_us: FieldId,
    /// One-way latency estimate (us)
    pub latency_us: FieldId,
    /// Tick of the outstanding ping check
    pub ping_check_tick: FieldId,
    /// Time the outstanding ping check was sent (us)
    pub ping_check_time_us: FieldId,
    /// Time since the last ping check (us)
    pub ping_elapsed_us: FieldId,
    /// Whether initial data went out to this player
    pub has_sent_initial_data: FieldId,
    /// Display name
    pub username: FieldId,
}

/// Ids inside one inventory item.
#[derive(Clone, Copy, Debug)]
pub struct ItemIds {
    /// Item kind
    pub id: FieldId,
    /// Remaining uses
    pub ammo: FieldId,
}

/// Ids inside the command input part.
#[derive(Clone, Copy, Debug)]
pub struct InputIds {
    /// Strafe axis `[-1, 1]`
    pub move_x: FieldId,
    /// Forward axis `[-1, 1]`
    pub move_y: FieldId,
    /// Look delta, degrees
    pub look_dx: FieldId,
    /// Look delta, degrees
    pub look_dy: FieldId,
    /// Jump edge
    pub jump: FieldId,
    /// Use-item edge
    pub use_item: FieldId,
    /// Cycle-item edge
    pub cycle_item: FieldId,
    /// Latest server tick the client received
    pub acknowledged_server_tick: FieldId,
}

/// Ids inside one world entity.
#[derive(Clone, Copy, Debug)]
pub struct EntityIds {
    /// Entity kind (absent = free slot)
    pub kind: FieldId,
    /// Player who created it
    pub owner: FieldId,
    /// Position
    pub position: FieldId,
    /// Velocity
    pub velocity: FieldId,
    /// Time alive (us)
    pub elapsed_us: FieldId,
    /// Detonated this tick
    pub detonated: FieldId,
}

/// Ids inside the session snapshot.
#[derive(Clone, Copy, Debug)]
pub struct SessionIds {
    /// Server stamp
    pub server_stamp: StampIds,
    /// Client-side estimate of the server stamp time
    pub localized_time_us: FieldId,
    /// Tick rate (Hz)
    pub tick_rate: FieldId,
    /// Active mode
    pub mode_id: FieldId,
    /// Recipient's player id, written per peer
    pub local_player_id: FieldId,
    /// Player array
    pub players: FieldId,
    /// Entity array
    pub entities: FieldId,
    /// Mode phase
    pub mode_phase: FieldId,
    /// Time in the current phase (us)
    pub mode_elapsed_us: FieldId,
    /// Score limit
    pub kill_limit: FieldId,
    /// Winning player, once decided
    pub winner: FieldId,
}

// =============================================================================
// SCHEMAS
// =============================================================================

/// All standard schemas for one session shape.
#[derive(Debug)]
pub struct StandardSchemas {
    /// Player element
    pub player: Arc<Schema>,
    /// Command input part
    pub input: Arc<Schema>,
    /// World entity element
    pub entity: Arc<Schema>,
    /// Inventory item element
    pub item: Arc<Schema>,
    /// Session
    pub session: Arc<Schema>,
    /// Player ids
    pub player_ids: PlayerIds,
    /// Input ids
    pub input_ids: InputIds,
    /// Entity ids
    pub entity_ids: EntityIds,
    /// Item ids
    pub item_ids: ItemIds,
    /// Session ids
    pub session_ids: SessionIds,
    /// Player array length
    pub max_players: usize,
    /// Entity array length
    pub max_entities: usize,
}

fn stamp(c: SchemaBuilder) -> SchemaBuilder {
    c.prop("tick", FieldKind::U32)
        .prop("time_us", FieldKind::U64)
        .prop("duration_us", FieldKind::U32)
}

fn item_schema() -> Arc<Schema> {
    SchemaBuilder::new("item")
        .prop("id", FieldKind::U8)
        .prop("ammo", FieldKind::U16)
        .build()
}

fn player_schema(item: &Schema) -> Arc<Schema> {
    SchemaBuilder::new("player")
        .component("client_stamp", stamp).never_compress()
        .component("server_stamp", stamp).trust(Trust::ServerOnly).never_compress()
        .component("localized_stamp", |c| c.prop("time_us", FieldKind::U64)).local_only()
        .component("move", |c| c
            .prop("position", FieldKind::Vec3).tolerance(0.01)
            .prop("velocity", FieldKind::Vec3).tolerance(0.01)
            .prop("ground_tick", FieldKind::U8)
            .prop("normalized_move", FieldKind::F32).tolerance(0.001)
                .interpolate(Interpolation::Cyclic { min: 0.0, max: 1.0 }))
        .component("camera", |c| c
            .prop("yaw", FieldKind::F32).interpolate(Interpolation::Angle)
            .prop("pitch", FieldKind::F32))
            .trust(Trust::ClientTrusted)
        .prop("health", FieldKind::U8).trust(Trust::ServerOnly).default_value(Value::U8(MAX_HEALTH))
        .prop("took_damage", FieldKind::U8).trust(Trust::ServerOnly).single_tick()
        .prop("respawn_timer_us", FieldKind::U32).trust(Trust::ServerOnly)
        .prop("team", FieldKind::U8).trust(Trust::ServerOnly)
        .component("stats", |c| c
            .prop("kills", FieldKind::U16)
            .prop("deaths", FieldKind::U16)
            .prop("damage", FieldKind::U16)
            .prop("ping_ms", FieldKind::U16))
            .trust(Trust::ServerOnly)
        .component("inventory", |c| c
            .prop("equipped_index", FieldKind::U8).trust(Trust::ClientTrusted)
            .array("items", INVENTORY_SLOTS, item).trust(Trust::ServerOnly))
        .component("ping", |c| c
            .prop("rtt_us", FieldKind::U32)
            .prop("latency_us", FieldKind::U32)
            .prop("check_tick", FieldKind::U32)
            .prop("check_time_us", FieldKind::U64)
            .prop("elapsed_us", FieldKind::U32))
            .local_only()
        .prop("has_sent_initial_data", FieldKind::Bool).local_only()
        .prop("username", FieldKind::Str).trust(Trust::ServerOnly)
        .build()
}

fn input_schema() -> Arc<Schema> {
    SchemaBuilder::new("input")
        .prop("move_x", FieldKind::F32)
        .prop("move_y", FieldKind::F32)
        .prop("look_dx", FieldKind::F32).single_tick()
        .prop("look_dy", FieldKind::F32).single_tick()
        .prop("jump", FieldKind::Bool).single_tick()
        .prop("use_item", FieldKind::Bool).single_tick()
        .prop("cycle_item", FieldKind::Bool).single_tick()
        .prop("acknowledged_server_tick", FieldKind::U32)
        .build()
}

fn entity_schema() -> Arc<Schema> {
    SchemaBuilder::new("entity")
        .prop("kind", FieldKind::U8)
        .prop("owner", FieldKind::U8)
        .prop("position", FieldKind::Vec3)
        .prop("velocity", FieldKind::Vec3)
        .prop("elapsed_us", FieldKind::U32)
        .prop("detonated", FieldKind::Bool).single_tick()
        .build()
}

fn session_schema(player: &Schema, entity: &Schema, max_players: u16, max_entities: u16) -> Arc<Schema> {
    SchemaBuilder::new("session")
        .component("server_stamp", stamp).never_compress()
        .component("localized_stamp", |c| c.prop("time_us", FieldKind::U64)).local_only()
        .prop("tick_rate", FieldKind::U16).never_compress()
        .prop("mode_id", FieldKind::U8).never_compress()
        .prop("local_player_id", FieldKind::U8).never_compress()
        .array("players", max_players, player)
        .array("entities", max_entities, entity)
        .component("mode", |c| c
            .prop("phase", FieldKind::U8)
            .prop("elapsed_us", FieldKind::U64)
            .prop("kill_limit", FieldKind::U16)
            .prop("winner", FieldKind::U8))
        .build()
}

impl StandardSchemas {
    /// Build every schema for a session of the given size.
    pub fn new(max_players: usize, max_entities: usize) -> Arc<Self> {
        let max_players = max_players.clamp(1, u8::MAX as usize);
        let max_entities = max_entities.min(u16::MAX as usize);
        let item = item_schema();
        let player = player_schema(&item);
        let input = input_schema();
        let entity = entity_schema();
        let session = session_schema(&player, &entity, max_players as u16, max_entities as u16);

        let p = &player;
        let player_ids = PlayerIds {
            client_stamp: StampIds::resolve(p, "client_stamp"),
            server_stamp: StampIds::resolve(p, "server_stamp"),
            localized_time_us: p.id("localized_stamp.time_us"),
            position: p.id("move.position"),
            velocity: p.id("move.velocity"),
            ground_tick: p.id("move.ground_tick"),
            normalized_move: p.id("move.normalized_move"),
            camera: p.id("camera"),
            yaw: p.id("camera.yaw"),
            pitch: p.id("camera.pitch"),
            health: p.id("health"),
            took_damage: p.id("took_damage"),
            respawn_timer_us: p.id("respawn_timer_us"),
            team: p.id("team"),
            kills: p.id("stats.kills"),
            deaths: p.id("stats.deaths"),
            damage: p.id("stats.damage"),
            ping_ms: p.id("stats.ping_ms"),
            equipped_index: p.id("inventory.equipped_index"),
            items: p.id("inventory.items"),
            rtt_us: p.id("ping.rtt_us"),
            latency_us: p.id("ping.latency_us"),
            ping_check_tick: p.id("ping.check_tick"),
            ping_check_time_us: p.id("ping.check_time_us"),
            ping_elapsed_us: p.id("ping.elapsed_us"),
            has_sent_initial_data: p.id("has_sent_initial_data"),
            username: p.id("username"),
        };
        let input_ids = InputIds {
            move_x: input.id("move_x"),
            move_y: input.id("move_y"),
            look_dx: input.id("look_dx"),
            look_dy: input.id("look_dy"),
            jump: input.id("jump"),
            use_item: input.id("use_item"),
            cycle_item: input.id("cycle_item"),
            acknowledged_server_tick: input.id("acknowledged_server_tick"),
        };
        let entity_ids = EntityIds {
            kind: entity.id("kind"),
            owner: entity.id("owner"),
            position: entity.id("position"),
            velocity: entity.id("velocity"),
            elapsed_us: entity.id("elapsed_us"),
            detonated: entity.id("detonated"),
        };
        let item_ids = ItemIds {
            id: item.id("id"),
            ammo: item.id("ammo"),
        };
        let session_ids = SessionIds {
            server_stamp: StampIds::resolve(&session, "server_stamp"),
            localized_time_us: session.id("localized_stamp.time_us"),
            tick_rate: session.id("tick_rate"),
            mode_id: session.id("mode_id"),
            local_player_id: session.id("local_player_id"),
            players: session.id("players"),
            entities: session.id("entities"),
            mode_phase: session.id("mode.phase"),
            mode_elapsed_us: session.id("mode.elapsed_us"),
            kill_limit: session.id("mode.kill_limit"),
            winner: session.id("mode.winner"),
        };

        Arc::new(Self {
            player,
            input,
            entity,
            item,
            session,
            player_ids,
            input_ids,
            entity_ids,
            item_ids,
            session_ids,
            max_players,
            max_entities,
        })
    }

    /// Whether a player slot is joined (health present).
    pub fn is_joined(&self, player: SnapshotRef<'_>) -> bool {
        player.has(self.player_ids.health)
    }

    /// Whether a joined player is alive.
    pub fn is_alive(&self, player: SnapshotRef<'_>) -> bool {
        player.get_u8(self.player_ids.health).map_or(false, |h| h > 0)
    }

    /// Local player id carried by a session, if any.
    pub fn local_player_id(&self, session: SnapshotRef<'_>) -> Option<u8> {
        session
            .get_u8(self.session_ids.local_player_id)
            .filter(|id| (*id as usize) < self.max_players)
    }

    /// Player element of a session.
    pub fn player_of<'a>(&self, session: SnapshotRef<'a>, player_id: u8) -> SnapshotRef<'a> {
        session.element(self.session_ids.players, player_id as usize)
    }

    /// Tick interval derived from the session's tick rate.
    pub fn tick_interval_us(&self, session: SnapshotRef<'_>) -> Option<u32> {
        session
            .get_u16(self.session_ids.tick_rate)
            .filter(|rate| *rate > 0)
            .map(|rate| 1_000_000 / rate as u32)
    }

    /// Apply damage from `attacker` to `victim` inside a session.
    ///
    /// Credits the kill and starts the respawn timer when health reaches
    /// zero. Returns `true` on a kill.
    pub fn apply_damage(&self, session: &mut SnapshotMut<'_>, attacker: u8, victim: u8, amount: u8) -> bool {
        let ids = &self.player_ids;
        let players = self.session_ids.players;
        let killed = {
            let mut player = session.element_mut(players, victim as usize);
            let Some(health) = player.get_u8(ids.health).filter(|h| *h > 0) else {
                return false;
            };
            let remaining = health.saturating_sub(amount);
            player.set_u8(ids.health, remaining);
            let taken = player.get_u8(ids.took_damage).unwrap_or(0);
            player.set_u8(ids.took_damage, taken.saturating_add(health - remaining));
            if remaining == 0 {
                let deaths = player.get_u16(ids.deaths).unwrap_or(0);
                player.set_u16(ids.deaths, deaths.saturating_add(1));
                player.set_u32(ids.respawn_timer_us, RESPAWN_DELAY_US);
            }
            remaining == 0
        };
        if attacker != victim && (attacker as usize) < self.max_players {
            let mut player = session.element_mut(players, attacker as usize);
            if player.has(ids.health) {
                let damage = player.get_u16(ids.damage).unwrap_or(0);
                player.set_u16(ids.damage, damage.saturating_add(amount as u16));
                if killed {
                    let kills = player.get_u16(ids.kills).unwrap_or(0);
                    player.set_u16(ids.kills, kills.saturating_add(1));
                }
            }
        }
        killed
    }
}

/// Delay between death and respawn.
pub const RESPAWN_DELAY_US: u32 = 3_000_000;

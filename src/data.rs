//! Shared snapshot layout and typed views.
//!
//! The host publishes one fixed-size snapshot per tick into the shared
//! region: a small header followed by five fixed-capacity append-only arrays
//! (events, strings, shapes, commands, unit commands), every field
//! little-endian. This module pins that layout down as offset constants and
//! wraps raw bytes in [`Snapshot`] (read view) and [`SnapshotMut`] (write
//! view) so nothing else in the crate touches offsets directly.
//!
//! The views borrow the underlying buffer; reading allocates nothing except
//! for strings that need lossy UTF-8 repair.

use std::borrow::Cow;

use crate::error::{ClientError, Result};

/// Maximum entry count for each snapshot array.
pub const MAX_COUNT: usize = 19999;

/// Nul-terminated cell size for the revision header field.
pub const REVISION_LEN: usize = 64;
/// Nul-terminated cell size for the map file name header field.
pub const MAP_FILE_NAME_LEN: usize = 264;
/// Nul-terminated cell size for one entry of the strings array.
pub const STRING_LEN: usize = 256;

const HDR_CLIENT_VERSION: usize = 0;
const HDR_REVISION: usize = 4;
const HDR_FRAME_COUNT: usize = HDR_REVISION + REVISION_LEN;
const HDR_IN_GAME: usize = HDR_FRAME_COUNT + 4;
const HDR_MAP_FILE_NAME: usize = HDR_IN_GAME + 4;
const HDR_EVENT_COUNT: usize = HDR_MAP_FILE_NAME + MAP_FILE_NAME_LEN;
const HDR_STRING_COUNT: usize = HDR_EVENT_COUNT + 4;
const HDR_SHAPE_COUNT: usize = HDR_STRING_COUNT + 4;
const HDR_COMMAND_COUNT: usize = HDR_SHAPE_COUNT + 4;
const HDR_UNIT_COMMAND_COUNT: usize = HDR_COMMAND_COUNT + 4;

const EVENT_SIZE: usize = 12;
const SHAPE_SIZE: usize = 40;
const COMMAND_SIZE: usize = 12;
const UNIT_COMMAND_SIZE: usize = 24;

const EVENTS_OFFSET: usize = HDR_UNIT_COMMAND_COUNT + 4;
const STRINGS_OFFSET: usize = EVENTS_OFFSET + EVENT_SIZE * MAX_COUNT;
const SHAPES_OFFSET: usize = STRINGS_OFFSET + STRING_LEN * MAX_COUNT;
const COMMANDS_OFFSET: usize = SHAPES_OFFSET + SHAPE_SIZE * MAX_COUNT;
const UNIT_COMMANDS_OFFSET: usize = COMMANDS_OFFSET + COMMAND_SIZE * MAX_COUNT;

/// Total size in bytes of one snapshot, and therefore of the shared region
/// and of every frame-buffer slot.
pub const SNAPSHOT_SIZE: usize = UNIT_COMMANDS_OFFSET + UNIT_COMMAND_SIZE * MAX_COUNT;

/// One entry of the discovery table the host publishes for clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameInstance {
    pub server_process_id: i32,
    pub is_connected: bool,
    pub last_keep_alive_time: i32,
}

/// Number of records in the discovery table.
pub const GAME_TABLE_MAX_GAMES: usize = 8;
/// Fixed width of one discovery-table record.
pub const GAME_INSTANCE_SIZE: usize = 12;

/// Parses the discovery table. Short input yields fewer records.
pub fn read_game_table(bytes: &[u8]) -> Vec<GameInstance> {
    bytes
        .chunks_exact(GAME_INSTANCE_SIZE)
        .take(GAME_TABLE_MAX_GAMES)
        .map(|record| GameInstance {
            server_process_id: read_i32(record, 0),
            is_connected: read_i32(record, 4) != 0,
            last_keep_alive_time: read_i32(record, 8),
        })
        .collect()
}

/// Host-side event kinds, by wire ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EventType {
    MatchStart = 0,
    MatchEnd = 1,
    MatchFrame = 2,
    MenuFrame = 3,
    SendText = 4,
    ReceiveText = 5,
    PlayerLeft = 6,
    NukeDetect = 7,
    UnitDiscover = 8,
    UnitEvade = 9,
    UnitShow = 10,
    UnitHide = 11,
    UnitCreate = 12,
    UnitDestroy = 13,
    UnitMorph = 14,
    UnitRenegade = 15,
    SaveGame = 16,
    UnitComplete = 17,
}

impl EventType {
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => EventType::MatchStart,
            1 => EventType::MatchEnd,
            2 => EventType::MatchFrame,
            3 => EventType::MenuFrame,
            4 => EventType::SendText,
            5 => EventType::ReceiveText,
            6 => EventType::PlayerLeft,
            7 => EventType::NukeDetect,
            8 => EventType::UnitDiscover,
            9 => EventType::UnitEvade,
            10 => EventType::UnitShow,
            11 => EventType::UnitHide,
            12 => EventType::UnitCreate,
            13 => EventType::UnitDestroy,
            14 => EventType::UnitMorph,
            15 => EventType::UnitRenegade,
            16 => EventType::SaveGame,
            17 => EventType::UnitComplete,
            _ => return None,
        })
    }
}

/// One entry of the events array. `p1`/`p2` are kind-dependent: a string
/// index for text events, a unit index for unit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Event {
    pub kind: i32,
    pub p1: i32,
    pub p2: i32,
}

impl Event {
    pub fn new(kind: EventType, p1: i32, p2: i32) -> Self {
        Self { kind: kind as i32, p1, p2 }
    }

    pub fn event_type(&self) -> Option<EventType> {
        EventType::from_raw(self.kind)
    }
}

/// Draw-command kinds, by wire ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ShapeType {
    None = 0,
    Text = 1,
    Box = 2,
    Triangle = 3,
    Circle = 4,
    Ellipse = 5,
    Dot = 6,
    Line = 7,
}

/// Coordinate space a shape is drawn in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CoordinateType {
    None = 0,
    Screen = 1,
    Map = 2,
    Mouse = 3,
}

/// One entry of the shapes array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Shape {
    pub shape_type: i32,
    pub coordinate_type: i32,
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub extra1: i32,
    pub extra2: i32,
    pub color: i32,
    pub is_solid: i32,
}

/// Game-level command kinds, by wire ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CommandType {
    SetScreenPosition = 0,
    PingMinimap = 1,
    EnableFlag = 2,
    Printf = 3,
    SendText = 4,
    PauseGame = 5,
    ResumeGame = 6,
    LeaveGame = 7,
    RestartGame = 8,
    SetLocalSpeed = 9,
    SetAlliance = 10,
    SetVision = 11,
    SetCommandOptimizerLevel = 12,
    SetRevealAll = 13,
}

/// One entry of the commands array. `value1` is a string index for text
/// commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Command {
    pub kind: i32,
    pub value1: i32,
    pub value2: i32,
}

impl Command {
    pub fn new(kind: CommandType, value1: i32, value2: i32) -> Self {
        Self { kind: kind as i32, value1, value2 }
    }
}

/// One entry of the unit-commands array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitCommand {
    pub kind: i32,
    pub unit: i32,
    pub target: i32,
    pub x: i32,
    pub y: i32,
    pub extra: i32,
}

/// Read view over one snapshot's bytes.
#[derive(Clone, Copy)]
pub struct Snapshot<'a> {
    bytes: &'a [u8],
}

impl<'a> Snapshot<'a> {
    /// Wraps a full-size snapshot buffer.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than [`SNAPSHOT_SIZE`]; every buffer in
    /// the pipeline (shared region, frame-buffer slot) is allocated at
    /// exactly that size.
    pub fn new(bytes: &'a [u8]) -> Self {
        assert!(bytes.len() >= SNAPSHOT_SIZE, "snapshot buffer too small");
        Self { bytes }
    }

    pub fn client_version(&self) -> i32 {
        read_i32(self.bytes, HDR_CLIENT_VERSION)
    }

    pub fn revision(&self) -> Cow<'a, str> {
        read_str(self.bytes, HDR_REVISION, REVISION_LEN)
    }

    pub fn frame_count(&self) -> i32 {
        read_i32(self.bytes, HDR_FRAME_COUNT)
    }

    pub fn in_game(&self) -> bool {
        read_i32(self.bytes, HDR_IN_GAME) != 0
    }

    pub fn map_file_name(&self) -> Cow<'a, str> {
        read_str(self.bytes, HDR_MAP_FILE_NAME, MAP_FILE_NAME_LEN)
    }

    pub fn event_count(&self) -> usize {
        read_count(self.bytes, HDR_EVENT_COUNT)
    }

    pub fn string_count(&self) -> usize {
        read_count(self.bytes, HDR_STRING_COUNT)
    }

    pub fn shape_count(&self) -> usize {
        read_count(self.bytes, HDR_SHAPE_COUNT)
    }

    pub fn command_count(&self) -> usize {
        read_count(self.bytes, HDR_COMMAND_COUNT)
    }

    pub fn unit_command_count(&self) -> usize {
        read_count(self.bytes, HDR_UNIT_COMMAND_COUNT)
    }

    /// Event at index `i < event_count()`.
    pub fn event(&self, i: usize) -> Event {
        let at = EVENTS_OFFSET + i * EVENT_SIZE;
        Event {
            kind: read_i32(self.bytes, at),
            p1: read_i32(self.bytes, at + 4),
            p2: read_i32(self.bytes, at + 8),
        }
    }

    /// All events present in this snapshot, in array order.
    pub fn events(&self) -> impl Iterator<Item = Event> + '_ {
        (0..self.event_count()).map(|i| self.event(i))
    }

    pub fn string(&self, i: usize) -> Cow<'a, str> {
        read_str(self.bytes, STRINGS_OFFSET + i * STRING_LEN, STRING_LEN)
    }

    pub fn shape(&self, i: usize) -> Shape {
        let at = SHAPES_OFFSET + i * SHAPE_SIZE;
        Shape {
            shape_type: read_i32(self.bytes, at),
            coordinate_type: read_i32(self.bytes, at + 4),
            x1: read_i32(self.bytes, at + 8),
            y1: read_i32(self.bytes, at + 12),
            x2: read_i32(self.bytes, at + 16),
            y2: read_i32(self.bytes, at + 20),
            extra1: read_i32(self.bytes, at + 24),
            extra2: read_i32(self.bytes, at + 28),
            color: read_i32(self.bytes, at + 32),
            is_solid: read_i32(self.bytes, at + 36),
        }
    }

    pub fn command(&self, i: usize) -> Command {
        let at = COMMANDS_OFFSET + i * COMMAND_SIZE;
        Command {
            kind: read_i32(self.bytes, at),
            value1: read_i32(self.bytes, at + 4),
            value2: read_i32(self.bytes, at + 8),
        }
    }

    pub fn unit_command(&self, i: usize) -> UnitCommand {
        let at = UNIT_COMMANDS_OFFSET + i * UNIT_COMMAND_SIZE;
        UnitCommand {
            kind: read_i32(self.bytes, at),
            unit: read_i32(self.bytes, at + 4),
            target: read_i32(self.bytes, at + 8),
            x: read_i32(self.bytes, at + 12),
            y: read_i32(self.bytes, at + 16),
            extra: read_i32(self.bytes, at + 20),
        }
    }
}

impl std::fmt::Debug for Snapshot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("frame_count", &self.frame_count())
            .field("in_game", &self.in_game())
            .field("event_count", &self.event_count())
            .field("string_count", &self.string_count())
            .field("shape_count", &self.shape_count())
            .field("command_count", &self.command_count())
            .field("unit_command_count", &self.unit_command_count())
            .finish_non_exhaustive()
    }
}

/// Write view over one snapshot's bytes. The host side of an in-process
/// region uses this to author frames; the client uses the `push_*` methods to
/// append outgoing entries at the live counts.
pub struct SnapshotMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> SnapshotMut<'a> {
    /// Wraps a full-size snapshot buffer mutably.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than [`SNAPSHOT_SIZE`].
    pub fn new(bytes: &'a mut [u8]) -> Self {
        assert!(bytes.len() >= SNAPSHOT_SIZE, "snapshot buffer too small");
        Self { bytes }
    }

    /// Read view of the same bytes.
    pub fn as_snapshot(&self) -> Snapshot<'_> {
        Snapshot::new(self.bytes)
    }

    pub fn set_client_version(&mut self, version: i32) {
        write_i32(self.bytes, HDR_CLIENT_VERSION, version);
    }

    pub fn set_revision(&mut self, revision: &str) {
        write_str(self.bytes, HDR_REVISION, REVISION_LEN, revision);
    }

    pub fn set_frame_count(&mut self, frame: i32) {
        write_i32(self.bytes, HDR_FRAME_COUNT, frame);
    }

    pub fn set_in_game(&mut self, in_game: bool) {
        write_i32(self.bytes, HDR_IN_GAME, in_game as i32);
    }

    pub fn set_map_file_name(&mut self, name: &str) {
        write_str(self.bytes, HDR_MAP_FILE_NAME, MAP_FILE_NAME_LEN, name);
    }

    pub fn set_event_count(&mut self, count: usize) {
        write_i32(self.bytes, HDR_EVENT_COUNT, count as i32);
    }

    pub fn set_string_count(&mut self, count: usize) {
        write_i32(self.bytes, HDR_STRING_COUNT, count as i32);
    }

    pub fn set_shape_count(&mut self, count: usize) {
        write_i32(self.bytes, HDR_SHAPE_COUNT, count as i32);
    }

    pub fn set_command_count(&mut self, count: usize) {
        write_i32(self.bytes, HDR_COMMAND_COUNT, count as i32);
    }

    pub fn set_unit_command_count(&mut self, count: usize) {
        write_i32(self.bytes, HDR_UNIT_COMMAND_COUNT, count as i32);
    }

    pub fn write_event(&mut self, i: usize, event: Event) {
        let at = EVENTS_OFFSET + i * EVENT_SIZE;
        write_i32(self.bytes, at, event.kind);
        write_i32(self.bytes, at + 4, event.p1);
        write_i32(self.bytes, at + 8, event.p2);
    }

    pub fn write_string(&mut self, i: usize, s: &str) {
        write_str(self.bytes, STRINGS_OFFSET + i * STRING_LEN, STRING_LEN, s);
    }

    pub fn write_shape(&mut self, i: usize, shape: Shape) {
        let at = SHAPES_OFFSET + i * SHAPE_SIZE;
        write_i32(self.bytes, at, shape.shape_type);
        write_i32(self.bytes, at + 4, shape.coordinate_type);
        write_i32(self.bytes, at + 8, shape.x1);
        write_i32(self.bytes, at + 12, shape.y1);
        write_i32(self.bytes, at + 16, shape.x2);
        write_i32(self.bytes, at + 20, shape.y2);
        write_i32(self.bytes, at + 24, shape.extra1);
        write_i32(self.bytes, at + 28, shape.extra2);
        write_i32(self.bytes, at + 32, shape.color);
        write_i32(self.bytes, at + 36, shape.is_solid);
    }

    pub fn write_command(&mut self, i: usize, command: Command) {
        let at = COMMANDS_OFFSET + i * COMMAND_SIZE;
        write_i32(self.bytes, at, command.kind);
        write_i32(self.bytes, at + 4, command.value1);
        write_i32(self.bytes, at + 8, command.value2);
    }

    pub fn write_unit_command(&mut self, i: usize, command: UnitCommand) {
        let at = UNIT_COMMANDS_OFFSET + i * UNIT_COMMAND_SIZE;
        write_i32(self.bytes, at, command.kind);
        write_i32(self.bytes, at + 4, command.unit);
        write_i32(self.bytes, at + 8, command.target);
        write_i32(self.bytes, at + 12, command.x);
        write_i32(self.bytes, at + 16, command.y);
        write_i32(self.bytes, at + 20, command.extra);
    }

    /// Appends an event at the current count. Used by host-side simulations;
    /// the live host writes its own arrays.
    pub fn push_event(&mut self, event: Event) -> Result<usize> {
        let i = self.as_snapshot().event_count();
        ensure_capacity("events", i)?;
        self.write_event(i, event);
        self.set_event_count(i + 1);
        Ok(i)
    }

    /// Appends to the strings array, returning the new entry's index.
    pub fn push_string(&mut self, s: &str) -> Result<usize> {
        let i = self.as_snapshot().string_count();
        ensure_capacity("strings", i)?;
        self.write_string(i, s);
        self.set_string_count(i + 1);
        Ok(i)
    }

    /// Appends to the shapes array, returning the new entry's index.
    pub fn push_shape(&mut self, shape: Shape) -> Result<usize> {
        let i = self.as_snapshot().shape_count();
        ensure_capacity("shapes", i)?;
        self.write_shape(i, shape);
        self.set_shape_count(i + 1);
        Ok(i)
    }

    /// Appends to the commands array, returning the new entry's index.
    pub fn push_command(&mut self, command: Command) -> Result<usize> {
        let i = self.as_snapshot().command_count();
        ensure_capacity("commands", i)?;
        self.write_command(i, command);
        self.set_command_count(i + 1);
        Ok(i)
    }

    /// Appends to the unit-commands array, returning the new entry's index.
    pub fn push_unit_command(&mut self, command: UnitCommand) -> Result<usize> {
        let i = self.as_snapshot().unit_command_count();
        ensure_capacity("unit commands", i)?;
        self.write_unit_command(i, command);
        self.set_unit_command_count(i + 1);
        Ok(i)
    }

    /// Clears the per-tick array counts. The host does this when it ingests
    /// the client's queued entries at the start of a tick.
    pub fn reset_counts(&mut self) {
        self.set_event_count(0);
        self.set_string_count(0);
        self.set_shape_count(0);
        self.set_command_count(0);
        self.set_unit_command_count(0);
    }
}

fn ensure_capacity(kind: &'static str, count: usize) -> Result<()> {
    if count >= MAX_COUNT {
        return Err(ClientError::Capacity { kind, cap: MAX_COUNT });
    }
    Ok(())
}

fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    i32::from_le_bytes(raw)
}

fn write_i32(bytes: &mut [u8], offset: usize, value: i32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Counts are stored as i32 by the host; clamp negatives to zero rather than
/// panicking on a corrupt header.
fn read_count(bytes: &[u8], offset: usize) -> usize {
    read_i32(bytes, offset).max(0) as usize
}

fn read_str(bytes: &[u8], offset: usize, len: usize) -> Cow<'_, str> {
    let cell = &bytes[offset..offset + len];
    let end = cell.iter().position(|&b| b == 0).unwrap_or(cell.len());
    String::from_utf8_lossy(&cell[..end])
}

fn write_str(bytes: &mut [u8], offset: usize, len: usize, s: &str) {
    let cell = &mut bytes[offset..offset + len];
    cell.fill(0);
    // Leave at least one trailing nul.
    let n = s.len().min(len - 1);
    cell[..n].copy_from_slice(&s.as_bytes()[..n]);
}

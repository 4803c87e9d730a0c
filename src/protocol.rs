//! JSON wire protocol: rover commands, tracking commands, handshakes.
//!
//! Every command travels as `{"cmd": <name>, "params": {...}}`. Direction,
//! motor and camera sets are small flag sets validated against fixed
//! allowed-combination tables; anything outside a table is rejected with the
//! matching [`Reason`].

use std::fmt;
use std::marker::PhantomData;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::Reason;
use crate::geometry::BoundingBox;

// ---------- flag sets ----------

pub trait FlagKind {
    const NAMES: &'static [(&'static str, u8)];
    const ALLOWED: &'static [u8];
    const REJECT: Reason;
}

pub struct Flags<K> {
    bits: u8,
    _kind: PhantomData<K>,
}

impl<K> Clone for Flags<K> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<K> Copy for Flags<K> {}
impl<K> PartialEq for Flags<K> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}
impl<K> Eq for Flags<K> {}

impl<K: FlagKind> fmt::Debug for Flags<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl<K> BitOr for Flags<K> {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self::from_bits(self.bits | rhs.bits)
    }
}

impl<K> Flags<K> {
    pub const EMPTY: Self = Self::from_bits(0);

    pub const fn from_bits(bits: u8) -> Self {
        Self {
            bits,
            _kind: PhantomData,
        }
    }

    pub fn is_empty(self) -> bool {
        self.bits == 0
    }
}

impl<K: FlagKind> Flags<K> {
    /// Parse a list of flag names and check the result against the table.
    pub fn from_names<I, S>(names: I) -> Result<Self, Reason>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut bits = 0u8;
        for name in names {
            let bit = K::NAMES
                .iter()
                .find(|(n, _)| *n == name.as_ref())
                .map(|(_, b)| *b)
                .ok_or(K::REJECT)?;
            bits |= bit;
        }
        let flags = Self::from_bits(bits);
        if flags.is_allowed() {
            Ok(flags)
        } else {
            Err(K::REJECT)
        }
    }

    pub fn is_allowed(self) -> bool {
        K::ALLOWED.contains(&self.bits)
    }

    pub fn names(self) -> Vec<&'static str> {
        K::NAMES
            .iter()
            .filter(|(_, b)| self.bits & b != 0)
            .map(|(n, _)| *n)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionKind;
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorsKind;
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CamDirectionKind;

pub type Direction = Flags<DirectionKind>;
pub type Motors = Flags<MotorsKind>;
pub type CamDirection = Flags<CamDirectionKind>;

impl Direction {
    pub const FORWARD: Self = Self::from_bits(1);
    pub const BACK: Self = Self::from_bits(2);
    pub const LEFT: Self = Self::from_bits(4);
    pub const RIGHT: Self = Self::from_bits(8);
    pub const CW: Self = Self::from_bits(16);
    pub const CCW: Self = Self::from_bits(32);
}

impl FlagKind for DirectionKind {
    const NAMES: &'static [(&'static str, u8)] = &[
        ("forward", 1),
        ("back", 2),
        ("left", 4),
        ("right", 8),
        ("cw", 16),
        ("ccw", 32),
    ];
    const ALLOWED: &'static [u8] = &[
        1,     // forward
        2,     // back
        4,     // left
        8,     // right
        1 | 4, // forward + left
        1 | 8, // forward + right
        2 | 4, // back + left
        2 | 8, // back + right
        16,    // cw
        32,    // ccw
    ];
    const REJECT: Reason = Reason::BadDirection;
}

impl Motors {
    pub const WHEELS: Self = Self::from_bits(1);
    pub const CAMERA: Self = Self::from_bits(2);
}

impl FlagKind for MotorsKind {
    const NAMES: &'static [(&'static str, u8)] = &[("wheels", 1), ("camera", 2)];
    const ALLOWED: &'static [u8] = &[1, 2, 1 | 2];
    const REJECT: Reason = Reason::BadMotors;
}

impl CamDirection {
    pub const UP: Self = Self::from_bits(1);
    pub const DOWN: Self = Self::from_bits(2);
    pub const CW: Self = Self::from_bits(4);
    pub const CCW: Self = Self::from_bits(8);
}

impl FlagKind for CamDirectionKind {
    const NAMES: &'static [(&'static str, u8)] =
        &[("up", 1), ("down", 2), ("cw", 4), ("ccw", 8)];
    // at most one tilt and one pan component
    const ALLOWED: &'static [u8] = &[1, 2, 4, 8, 1 | 4, 1 | 8, 2 | 4, 2 | 8];
    const REJECT: Reason = Reason::BadDirection;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaserAction {
    On,
    Off,
    Blink,
}

impl LaserAction {
    pub fn from_name(s: &str) -> Result<Self, Reason> {
        match s {
            "on" => Ok(LaserAction::On),
            "off" => Ok(LaserAction::Off),
            "blink" => Ok(LaserAction::Blink),
            _ => Err(Reason::BadAction),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LaserAction::On => "on",
            LaserAction::Off => "off",
            LaserAction::Blink => "blink",
        }
    }
}

// ---------- commands ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Move,
    MoveStop,
    MoveCam,
    SetCam,
    SetSpeed,
    SetCamSpeed,
    LaserCtrl,
    TrackCustom,
    TrackFaces,
    StopTracking,
    Follow,
}

impl CommandKind {
    pub const ALL: [CommandKind; 11] = [
        CommandKind::Move,
        CommandKind::MoveStop,
        CommandKind::MoveCam,
        CommandKind::SetCam,
        CommandKind::SetSpeed,
        CommandKind::SetCamSpeed,
        CommandKind::LaserCtrl,
        CommandKind::TrackCustom,
        CommandKind::TrackFaces,
        CommandKind::StopTracking,
        CommandKind::Follow,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Move => "move",
            CommandKind::MoveStop => "move_stop",
            CommandKind::MoveCam => "move_cam",
            CommandKind::SetCam => "set_cam",
            CommandKind::SetSpeed => "set_speed",
            CommandKind::SetCamSpeed => "set_cam_speed",
            CommandKind::LaserCtrl => "laser_ctrl",
            CommandKind::TrackCustom => "track_custom",
            CommandKind::TrackFaces => "track_faces",
            CommandKind::StopTracking => "stop_tracking",
            CommandKind::Follow => "follow",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Handled by the proxy's tracking controller instead of the rover.
    pub fn is_tracking(self) -> bool {
        matches!(
            self,
            CommandKind::TrackCustom
                | CommandKind::TrackFaces
                | CommandKind::StopTracking
                | CommandKind::Follow
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoverCommand {
    Move(Direction),
    MoveStop(Motors),
    MoveCam(CamDirection),
    SetCam([f64; 2]),
    SetSpeed(f64),
    SetCamSpeed([f64; 2]),
    LaserCtrl(LaserAction),
}

impl RoverCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            RoverCommand::Move(_) => CommandKind::Move,
            RoverCommand::MoveStop(_) => CommandKind::MoveStop,
            RoverCommand::MoveCam(_) => CommandKind::MoveCam,
            RoverCommand::SetCam(_) => CommandKind::SetCam,
            RoverCommand::SetSpeed(_) => CommandKind::SetSpeed,
            RoverCommand::SetCamSpeed(_) => CommandKind::SetCamSpeed,
            RoverCommand::LaserCtrl(_) => CommandKind::LaserCtrl,
        }
    }

    pub fn to_json(&self) -> Value {
        let params = match self {
            RoverCommand::Move(d) => json!({ "direction": d.names() }),
            RoverCommand::MoveStop(m) => json!({ "motors": m.names() }),
            RoverCommand::MoveCam(d) => json!({ "direction": d.names() }),
            RoverCommand::SetCam(a) => json!({ "angles": a }),
            RoverCommand::SetSpeed(s) => json!({ "speed": s }),
            RoverCommand::SetCamSpeed(s) => json!({ "speed": s }),
            RoverCommand::LaserCtrl(a) => json!({ "action": a.as_str() }),
        };
        json!({ "cmd": self.kind().name(), "params": params })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackingCommand {
    TrackCustom(BoundingBox),
    TrackFaces,
    StopTracking,
    Follow { wheels: bool, camera: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Rover(RoverCommand),
    Tracking(TrackingCommand),
}

#[derive(Deserialize)]
struct DirectionParams {
    direction: OneOrMany,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Deserialize)]
struct MotorsParams {
    motors: Vec<String>,
}

#[derive(Deserialize)]
struct AnglesParams {
    angles: [f64; 2],
}

#[derive(Deserialize)]
struct SpeedParams {
    speed: f64,
}

#[derive(Deserialize)]
struct CamSpeedParams {
    speed: [f64; 2],
}

#[derive(Deserialize)]
struct ActionParams {
    action: String,
}

#[derive(Deserialize)]
struct RoiParams {
    roi: BoundingBox,
}

#[derive(Deserialize)]
struct FollowParams {
    #[serde(default)]
    wheels: bool,
    #[serde(default, alias = "cam")]
    camera: bool,
}

fn params<T: serde::de::DeserializeOwned>(v: &Value) -> Result<T, Reason> {
    let p = v.get("params").cloned().unwrap_or_else(|| json!({}));
    serde_json::from_value(p).map_err(|_| Reason::BadParams)
}

pub fn parse_command(text: &str) -> Result<ClientCommand, Reason> {
    let v: Value = serde_json::from_str(text).map_err(|_| Reason::ParsingError)?;
    let name = v
        .get("cmd")
        .and_then(Value::as_str)
        .ok_or(Reason::ParsingError)?;
    let kind = CommandKind::from_name(name).ok_or(Reason::UnknownCmd)?;
    dispatch(kind, &v)
}

pub fn dispatch(kind: CommandKind, v: &Value) -> Result<ClientCommand, Reason> {
    use ClientCommand::{Rover, Tracking};

    let cmd = match kind {
        CommandKind::Move => {
            let p: DirectionParams = params(v)?;
            Rover(RoverCommand::Move(Direction::from_names(
                p.direction.into_vec(),
            )?))
        }
        CommandKind::MoveStop => {
            let p: MotorsParams = params(v)?;
            Rover(RoverCommand::MoveStop(Motors::from_names(p.motors)?))
        }
        CommandKind::MoveCam => {
            let p: DirectionParams = params(v)?;
            Rover(RoverCommand::MoveCam(CamDirection::from_names(
                p.direction.into_vec(),
            )?))
        }
        CommandKind::SetCam => {
            let p: AnglesParams = params(v)?;
            if !p.angles.iter().all(|a| a.is_finite()) {
                return Err(Reason::BadParams);
            }
            Rover(RoverCommand::SetCam(p.angles))
        }
        CommandKind::SetSpeed => {
            let p: SpeedParams = params(v)?;
            if !(0.0..=1.0).contains(&p.speed) {
                return Err(Reason::BadParams);
            }
            Rover(RoverCommand::SetSpeed(p.speed))
        }
        CommandKind::SetCamSpeed => {
            let p: CamSpeedParams = params(v)?;
            if !p.speed.iter().all(|s| (0.0..=90.0).contains(s)) {
                return Err(Reason::BadParams);
            }
            Rover(RoverCommand::SetCamSpeed(p.speed))
        }
        CommandKind::LaserCtrl => {
            let p: ActionParams = params(v)?;
            Rover(RoverCommand::LaserCtrl(LaserAction::from_name(&p.action)?))
        }
        CommandKind::TrackCustom => {
            let p: RoiParams = params(v)?;
            if !p.roi.is_valid_roi() {
                return Err(Reason::BadRoi);
            }
            Tracking(TrackingCommand::TrackCustom(p.roi))
        }
        CommandKind::TrackFaces => Tracking(TrackingCommand::TrackFaces),
        CommandKind::StopTracking => Tracking(TrackingCommand::StopTracking),
        CommandKind::Follow => {
            let p: FollowParams = params(v)?;
            Tracking(TrackingCommand::Follow {
                wheels: p.wheels,
                camera: p.camera,
            })
        }
    };
    Ok(cmd)
}

// ---------- replies ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    Failed { info: Reason },
}

impl Reply {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "msg": "failed" }))
    }
}

/// What a rover sends back after executing a command. `info` is kept raw so
/// unknown reasons from newer firmware still get logged.
#[derive(Debug, Clone, Deserialize)]
pub struct RoverReply {
    pub msg: String,
    #[serde(default)]
    pub info: Option<String>,
}

// ---------- handshakes ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mobility {
    Wheels,
    Gimbal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoverData {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub fov: f64,
    #[serde(default)]
    pub mobility: Vec<Mobility>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_size: Option<[u32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framerate: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoverHello {
    pub rover_id: String,
    pub rover_data: RoverData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetStream {
    #[serde(default)]
    pub rover_id: Option<String>,
    pub cmd: String,
    pub conf: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub rover_id: Option<String>,
    #[serde(default)]
    pub cmd: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoverListing {
    pub rover_id: String,
    pub rover_data: RoverData,
}

pub fn hello_ack(server_id: &str) -> Value {
    json!({ "server_id": server_id, "msg": "ack" })
}

pub fn rover_list(server_id: &str, rovers: &[RoverListing]) -> Value {
    json!({ "server_id": server_id, "rovers": rovers })
}

pub fn connect_ok(server_id: &str, client_id: &str, rover_id: &str) -> Value {
    json!({
        "server_id": server_id,
        "client_id": client_id,
        "rover_id": rover_id,
        "msg": "ok",
    })
}

/// `MAGIC | width (u16 BE) | height (u16 BE)`, sent once before video chunks.
pub fn stream_header(magic: [u8; 4], width: u16, height: u16) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&magic);
    out[4..6].copy_from_slice(&width.to_be_bytes());
    out[6..8].copy_from_slice(&height.to_be_bytes());
    out
}

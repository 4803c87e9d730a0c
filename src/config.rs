use anyhow::{Context, Result, anyhow};
use directories::UserDirs;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub rover_port: u16,
    pub control_port: u16,
    pub stream_port: u16,
    pub client_write_timeout_ms: u64,
    pub client_poll_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            rover_port: 6666,
            control_port: 8888,
            stream_port: 8889,
            client_write_timeout_ms: 2000,
            client_poll_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub magic: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub chunk_size: usize,
    pub conf_dir: PathBuf,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            magic: "jsmp".into(),
            width: 640,
            height: 480,
            framerate: 30,
            chunk_size: 32768,
            conf_dir: PathBuf::from("."),
        }
    }
}

/// An external program plus an argument template. `{name}` placeholders are
/// substituted per rover when the process is spawned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ProcessConfig {
    pub fn render_args(&self, vars: &[(&str, String)]) -> Vec<String> {
        self.args
            .iter()
            .map(|a| {
                vars.iter().fold(a.clone(), |acc, (k, v)| {
                    acc.replace(&format!("{{{k}}}"), v)
                })
            })
            .collect()
    }

    fn default_transcoder() -> Self {
        Self {
            program: "ffmpeg".into(),
            args: [
                "-loglevel", "error", "-f", "rawvideo", "-pix_fmt", "bgr24", "-s",
                "{width}x{height}", "-r", "{framerate}", "-i", "-", "-f", "mpeg1video",
                "-b:v", "1000k", "-r", "{framerate}", "-",
            ]
            .map(String::from)
            .to_vec(),
        }
    }

    fn default_capture() -> Self {
        Self {
            program: "ffmpeg".into(),
            args: [
                "-loglevel", "error", "-protocol_whitelist", "file,rtp,udp", "-i", "{conf}",
                "-f", "rawvideo", "-pix_fmt", "bgr24", "-s", "{width}x{height}", "-",
            ]
            .map(String::from)
            .to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowConfig {
    pub cam_dead_band: f64,
    pub cam_move_threshold: f64,
    pub cam_min_speed: f64,
    pub area_threshold: f64,
    pub area_dead_band: f64,
    pub wheel_move_threshold: f64,
    pub rotate_dead_band: f64,
    pub min_forward_speed: f64,
}

impl Default for FollowConfig {
    fn default() -> Self {
        Self {
            cam_dead_band: 15.0,
            cam_move_threshold: 20.0,
            cam_min_speed: 0.5,
            area_threshold: -0.01,
            area_dead_band: 0.015,
            wheel_move_threshold: 40.0,
            rotate_dead_band: 60.0,
            min_forward_speed: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default = "ProcessConfig::default_transcoder")]
    pub transcoder: ProcessConfig,
    #[serde(default = "ProcessConfig::default_capture")]
    pub capture: ProcessConfig,
    #[serde(default)]
    pub follow: FollowConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            stream: StreamConfig::default(),
            transcoder: ProcessConfig::default_transcoder(),
            capture: ProcessConfig::default_capture(),
            follow: FollowConfig::default(),
        }
    }
}

fn config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .ok_or_else(|| anyhow!("cannot resolve home directory"))?
        .home_dir()
        .to_path_buf();
    Ok(home.join(".config").join("rover-proxy"))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("proxy.toml"))
}

fn default_config_text() -> &'static str {
    include_str!("../config/default.toml")
}

impl ProxyConfig {
    /// Load `path`, or the per-user default file (installed on first run).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from(p),
            None => {
                let p = default_config_path()?;
                if !p.exists() {
                    if let Some(dir) = p.parent() {
                        fs::create_dir_all(dir)?;
                    }
                    fs::write(&p, default_config_text())?;
                    info!("installed default config at {}", p.display());
                }
                Self::load_from(&p)
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let txt = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&txt).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(txt: &str) -> Result<Self> {
        let cfg: ProxyConfig = toml::from_str(txt)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.server;
        let ports = [s.rover_port, s.control_port, s.stream_port];
        if ports.contains(&0) {
            return Err(anyhow!("listener ports must be non-zero"));
        }
        if ports.iter().collect::<HashSet<_>>().len() != ports.len() {
            return Err(anyhow!("rover, control and stream ports must differ"));
        }
        if self.stream.magic.len() != 4 || !self.stream.magic.is_ascii() {
            return Err(anyhow!("stream.magic must be exactly 4 ASCII bytes"));
        }
        if self.stream.width == 0 || self.stream.height == 0 || self.stream.framerate == 0 {
            return Err(anyhow!("stream width/height/framerate must be positive"));
        }
        if self.stream.width > u32::from(u16::MAX) || self.stream.height > u32::from(u16::MAX) {
            return Err(anyhow!("stream size must fit the 16-bit header fields"));
        }
        if self.stream.chunk_size == 0 {
            return Err(anyhow!("stream.chunk_size must be positive"));
        }
        if self.transcoder.program.trim().is_empty() || self.capture.program.trim().is_empty() {
            return Err(anyhow!("transcoder and capture programs must be set"));
        }
        if self.follow.area_threshold >= 0.0 {
            return Err(anyhow!("follow.area_threshold must be negative"));
        }
        Ok(())
    }

    pub fn magic_bytes(&self) -> [u8; 4] {
        let mut out = [0u8; 4];
        for (dst, src) in out.iter_mut().zip(self.stream.magic.bytes()) {
            *dst = src;
        }
        out
    }
}

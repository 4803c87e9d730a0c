//! One registered rover: its media pipeline, tracking state and clients.
//!
//! A session runs three loops: the capture pump (frames into the buffer), the
//! feed loop (buffer, tracking, transcoder input) and the broadcast loop
//! (transcoder output to viewers). Teardown runs in a fixed order: capture,
//! transcoder input, rover socket, clients.

use log::{debug, info, warn};
use serde_json::Value;
use std::{
    fs,
    io::Write,
    net::{Shutdown, TcpStream},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use crate::config::{FollowConfig, StreamConfig};
use crate::error::{ProxyError, Reason, Result};
use crate::frame::{Frame, FrameBuffer};
use crate::media::{CapturePump, MediaFactory, StreamFormat, TranscodePipeline};
use crate::protocol::{Mobility, RoverCommand, RoverData, RoverHello, RoverListing, TrackingCommand};
use crate::registry::{ClientRegistry, PeerSink};
use crate::tracking::{Capabilities, CommandSink, TrackingController};
use crate::vision::VisionBackend;

pub type Peer = Box<dyn PeerSink>;

/// What a rover announced about itself, resolved against configured defaults.
#[derive(Debug, Clone)]
pub struct RoverIdentity {
    pub rover_id: String,
    pub data: RoverData,
    pub caps: Capabilities,
    pub format: StreamFormat,
}

impl RoverIdentity {
    pub fn from_hello(hello: RoverHello, defaults: &StreamConfig) -> Result<Self> {
        let rover_id = hello.rover_id.trim().to_string();
        // the id names the descriptor file on disk
        if rover_id.is_empty()
            || rover_id.starts_with('.')
            || rover_id.contains(|c: char| c == '/' || c == '\\' || c.is_control())
        {
            return Err(ProxyError::Handshake(format!(
                "invalid rover_id {:?}",
                hello.rover_id
            )));
        }

        let data = hello.rover_data;
        let [width, height] = data
            .stream_size
            .unwrap_or([defaults.width, defaults.height]);
        let max = u32::from(u16::MAX);
        if width == 0 || height == 0 || width > max || height > max {
            return Err(ProxyError::Handshake(format!(
                "unsupported stream size {width}x{height}"
            )));
        }
        let framerate = data
            .framerate
            .filter(|f| *f > 0)
            .unwrap_or(defaults.framerate);
        let caps = Capabilities {
            wheels: data.mobility.contains(&Mobility::Wheels),
            gimbal: data.mobility.contains(&Mobility::Gimbal),
        };

        Ok(Self {
            rover_id,
            data,
            caps,
            format: StreamFormat {
                width,
                height,
                framerate,
            },
        })
    }

    pub fn listing(&self) -> RoverListing {
        RoverListing {
            rover_id: self.rover_id.clone(),
            rover_data: self.data.clone(),
        }
    }
}

pub struct RoverLink {
    stream: Mutex<TcpStream>,
}

impl RoverLink {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Mutex::new(stream),
        }
    }

    pub fn send_json(&self, v: &Value) -> Result<()> {
        let line = serde_json::to_string(v)? + "\n";
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        stream.write_all(line.as_bytes())?;
        stream.flush()?;
        Ok(())
    }

    pub fn shutdown(&self) {
        let stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = stream.shutdown(Shutdown::Both);
    }
}

impl CommandSink for RoverLink {
    fn send(&self, cmd: &RoverCommand) -> Result<()> {
        self.send_json(&cmd.to_json())
    }
}

pub struct SessionContext {
    pub media: Arc<dyn MediaFactory>,
    pub vision: Arc<dyn VisionBackend>,
    pub stream: StreamConfig,
    pub follow: FollowConfig,
}

impl SessionContext {
    pub fn conf_path(&self, rover_id: &str) -> PathBuf {
        self.stream.conf_dir.join(format!("{rover_id}.sdp"))
    }
}

fn persist_conf(path: &Path, conf: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, conf)?;
    info!("stream descriptor written to {}", path.display());
    Ok(())
}

pub struct RoverSession {
    identity: RoverIdentity,
    conf_path: PathBuf,
    chunk_size: usize,
    media: Arc<dyn MediaFactory>,
    buffer: Arc<FrameBuffer>,
    transcoder: TranscodePipeline,
    tracking: Mutex<TrackingController>,
    clients: ClientRegistry<Peer>,
    link: RoverLink,
    pump: Mutex<Option<CapturePump>>,
    closed: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RoverSession {
    pub fn start(
        ctx: &SessionContext,
        identity: RoverIdentity,
        link: RoverLink,
        conf: &str,
    ) -> Result<Arc<Self>> {
        let rover_id = identity.rover_id.clone();
        let format = identity.format;
        let conf_path = ctx.conf_path(&rover_id);
        persist_conf(&conf_path, conf)?;

        let transcoder = ctx.media.open_transcoder(format)?;
        let buffer = Arc::new(FrameBuffer::new());
        let source = ctx.media.open_source(format, &conf_path)?;
        let pump = CapturePump::start(&rover_id, source, buffer.clone(), format.framerate)?;
        let tracking = TrackingController::new(
            &rover_id,
            identity.caps,
            (format.width, format.height),
            ctx.vision.clone(),
            ctx.follow.clone(),
        );

        let session = Arc::new(Self {
            clients: ClientRegistry::new(&rover_id),
            identity,
            conf_path,
            chunk_size: ctx.stream.chunk_size,
            media: ctx.media.clone(),
            buffer,
            transcoder,
            tracking: Mutex::new(tracking),
            link,
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });

        let spawned = session
            .spawn_worker("feed", Self::feed_loop)
            .and_then(|_| session.spawn_worker("stream", Self::broadcast_loop));
        if let Err(e) = spawned {
            session.shutdown();
            return Err(e);
        }

        info!(
            "session[{}]: started {}x{}@{} (wheels={}, gimbal={})",
            rover_id,
            format.width,
            format.height,
            format.framerate,
            session.identity.caps.wheels,
            session.identity.caps.gimbal
        );
        Ok(session)
    }

    fn spawn_worker(self: &Arc<Self>, role: &str, body: fn(&RoverSession)) -> Result<()> {
        let me = self.clone();
        let handle = thread::Builder::new()
            .name(format!("{role}-{}", self.identity.rover_id))
            .spawn(move || body(&me))?;
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    pub fn identity(&self) -> &RoverIdentity {
        &self.identity
    }

    pub fn rover_id(&self) -> &str {
        &self.identity.rover_id
    }

    pub fn conf_path(&self) -> &Path {
        &self.conf_path
    }

    pub fn link(&self) -> &RoverLink {
        &self.link
    }

    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn apply_tracking(&self, cmd: &TrackingCommand) -> Result<(), Reason> {
        self.tracking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(cmd)
    }

    /// `(wheels, camera)` follow flags as currently honoured.
    pub fn following(&self) -> (bool, bool) {
        self.tracking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .following()
    }

    pub fn forward(&self, cmd: &RoverCommand) -> Result<()> {
        if !self.is_alive() {
            return Err(ProxyError::SessionClosed);
        }
        debug!("session[{}]: forwarding {:?}", self.rover_id(), cmd);
        self.link.send(cmd)
    }

    pub fn add_control_client(&self, id: &str, peer: Peer) {
        self.clients.add_control_client(id, peer);
        if !self.is_alive() {
            self.clients.close_all();
        }
    }

    pub fn add_stream_client(&self, id: &str, peer: Peer) {
        self.clients.add_stream_client(id, peer);
        if !self.is_alive() {
            self.clients.close_all();
        }
    }

    pub fn remove_control_client(&self, id: &str) {
        if self.clients.remove_control(id) {
            info!("session[{}]: control client {id} removed", self.rover_id());
        }
    }

    pub fn stream_clients(&self) -> usize {
        self.clients.stream_count()
    }

    pub fn relay_to_controllers(&self, text: &str) {
        for id in self.clients.broadcast_control(text) {
            info!(
                "session[{}]: control client {id} dropped after failed send",
                self.rover_id()
            );
        }
    }

    pub fn restart_capture(&self, conf: &str) -> Result<()> {
        // shutdown takes the pump lock after marking the session closed
        let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_alive() {
            return Err(ProxyError::SessionClosed);
        }
        persist_conf(&self.conf_path, conf)?;
        if let Some(mut old) = pump.take() {
            old.stop();
        }
        let format = self.identity.format;
        let source = self.media.open_source(format, &self.conf_path)?;
        *pump = Some(CapturePump::start(
            self.rover_id(),
            source,
            self.buffer.clone(),
            format.framerate,
        )?);
        info!("session[{}]: capture restarted", self.rover_id());
        Ok(())
    }

    fn feed_loop(&self) {
        let idle = CapturePump::interval(self.identity.format.framerate) / 2;
        let expected = Frame::byte_len(self.identity.format.width, self.identity.format.height);
        while self.is_alive() {
            let Some(mut frame) = self.buffer.read() else {
                thread::sleep(idle);
                continue;
            };
            if frame.data.len() != expected {
                warn!(
                    "session[{}]: dropping {}x{} frame, stream is {}x{}",
                    self.rover_id(),
                    frame.width,
                    frame.height,
                    self.identity.format.width,
                    self.identity.format.height
                );
                continue;
            }
            self.tracking
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .do_tracking(&mut frame, &self.link);
            if let Err(e) = self.transcoder.submit(&frame.data) {
                if self.is_alive() {
                    warn!("session[{}]: transcoder input failed: {e}", self.rover_id());
                }
                break;
            }
        }
        debug!("session[{}]: feed loop stopped", self.rover_id());
    }

    fn broadcast_loop(&self) {
        loop {
            match self.transcoder.next_chunk(self.chunk_size) {
                Ok(chunk) if chunk.is_empty() => {
                    info!("session[{}]: transcoder output ended", self.rover_id());
                    break;
                }
                Ok(chunk) => {
                    for id in self.clients.broadcast_stream(&chunk) {
                        info!(
                            "session[{}]: viewer {id} dropped after failed send",
                            self.rover_id()
                        );
                    }
                }
                Err(e) => {
                    warn!("session[{}]: transcoder read failed: {e}", self.rover_id());
                    break;
                }
            }
        }
        self.shutdown();
    }

    /// Tear the session down. Safe to call from any thread, any number of
    /// times, including from the session's own loops.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("session[{}]: tearing down", self.rover_id());

        if let Some(mut pump) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.stop();
        }
        self.transcoder.close();
        self.link.shutdown();
        self.clients.close_all();

        let current = thread::current().id();
        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in workers {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        info!("session[{}]: closed", self.rover_id());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ProcessConfig;
    use crate::media::FrameSource;
    use crate::protocol::LaserAction;
    use crate::registry::tests::FakePeer;
    use crate::vision::StaticVision;
    use serde_json::json;
    use std::io::{BufRead, BufReader, Read};
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    /// Emits solid grey frames of the requested size.
    struct Solid {
        format: StreamFormat,
    }

    impl FrameSource for Solid {
        fn grab(&self) -> Result<Frame> {
            let mut f = Frame::blank(self.format.width, self.format.height);
            f.data.fill(0x80);
            Ok(f)
        }
    }

    /// Synthetic frames in, `cat` as the transcoder.
    pub(crate) struct SyntheticMedia;

    impl MediaFactory for SyntheticMedia {
        fn open_source(&self, format: StreamFormat, _conf: &Path) -> Result<Arc<dyn FrameSource>> {
            Ok(Arc::new(Solid { format }))
        }

        fn open_transcoder(&self, format: StreamFormat) -> Result<TranscodePipeline> {
            let cat = ProcessConfig {
                program: "cat".into(),
                args: vec![],
            };
            TranscodePipeline::spawn(&cat, format)
        }
    }

    pub(crate) fn context(conf_dir: &Path) -> SessionContext {
        SessionContext {
            media: Arc::new(SyntheticMedia),
            vision: Arc::new(StaticVision),
            stream: StreamConfig {
                width: 8,
                height: 8,
                framerate: 50,
                chunk_size: 64,
                conf_dir: conf_dir.to_path_buf(),
                ..StreamConfig::default()
            },
            follow: FollowConfig::default(),
        }
    }

    fn hello(json: Value) -> RoverHello {
        serde_json::from_value(json).unwrap()
    }

    /// (proxy side, rover side) of a loopback connection.
    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let rover = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (proxy, _) = listener.accept().unwrap();
        (proxy, rover)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn identity_resolves_defaults_and_capabilities() {
        let defaults = StreamConfig::default();
        let id = RoverIdentity::from_hello(
            hello(json!({"rover_id": "r1", "rover_data": {
                "description": "test", "fov": 60.0, "mobility": ["wheels"]}})),
            &defaults,
        )
        .unwrap();
        assert_eq!(
            id.caps,
            Capabilities {
                wheels: true,
                gimbal: false
            }
        );
        assert_eq!(
            id.format,
            StreamFormat {
                width: 640,
                height: 480,
                framerate: 30
            }
        );

        let id = RoverIdentity::from_hello(
            hello(json!({"rover_id": "r2", "rover_data": {
                "mobility": ["gimbal"], "stream_size": [320, 240], "framerate": 15}})),
            &defaults,
        )
        .unwrap();
        assert!(id.caps.gimbal && !id.caps.wheels);
        assert_eq!((id.format.width, id.format.framerate), (320, 15));
        assert_eq!(id.listing().rover_id, "r2");
    }

    #[test]
    fn identity_rejects_path_like_ids_and_empty_sizes() {
        let defaults = StreamConfig::default();
        for bad in ["", "../etc", "a/b", ".hidden"] {
            let h = hello(json!({"rover_id": bad, "rover_data": {}}));
            assert!(RoverIdentity::from_hello(h, &defaults).is_err(), "{bad}");
        }
        let h = hello(json!({"rover_id": "ok", "rover_data": {"stream_size": [0, 10]}}));
        assert!(RoverIdentity::from_hello(h, &defaults).is_err());
    }

    #[test]
    fn session_streams_to_viewers_and_tears_down_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let (proxy, mut rover) = socket_pair();
        let identity = RoverIdentity::from_hello(
            hello(json!({"rover_id": "r1", "rover_data": {"mobility": ["wheels"]}})),
            &ctx.stream,
        )
        .unwrap();

        let session =
            RoverSession::start(&ctx, identity, RoverLink::new(proxy), "v=0\n").unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("r1.sdp")).unwrap(), "v=0\n");

        let viewer = FakePeer::new(false);
        let broken = FakePeer::new(true);
        session.add_stream_client("v1", Box::new(viewer.clone()));
        session.add_stream_client("v2", Box::new(broken.clone()));

        assert!(wait_for(|| !viewer.inbox.lock().unwrap().binary.is_empty()));
        let first = viewer.inbox.lock().unwrap().binary[0].clone();
        assert!(first.len() <= 64);
        assert!(first.iter().all(|b| *b == 0x80));
        assert!(wait_for(|| session.stream_clients() == 1));
        assert!(broken.inbox.lock().unwrap().closed);

        session.shutdown();
        assert!(!session.is_alive());
        assert!(viewer.inbox.lock().unwrap().closed);
        let mut buf = [0u8; 16];
        assert_eq!(rover.read(&mut buf).unwrap(), 0);
        assert!(matches!(
            session.forward(&RoverCommand::LaserCtrl(LaserAction::On)),
            Err(ProxyError::SessionClosed)
        ));
        session.shutdown();
    }

    #[test]
    fn forwarded_commands_reach_the_rover_as_lines() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let (proxy, rover) = socket_pair();
        let identity = RoverIdentity::from_hello(
            hello(json!({"rover_id": "r1", "rover_data": {}})),
            &ctx.stream,
        )
        .unwrap();
        let session = RoverSession::start(&ctx, identity, RoverLink::new(proxy), "").unwrap();

        session
            .forward(&RoverCommand::LaserCtrl(LaserAction::Blink))
            .unwrap();
        let mut line = String::new();
        BufReader::new(rover).read_line(&mut line).unwrap();
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v, json!({"cmd": "laser_ctrl", "params": {"action": "blink"}}));
        session.shutdown();
    }

    #[test]
    fn follow_is_masked_by_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let (proxy, _rover) = socket_pair();
        let identity = RoverIdentity::from_hello(
            hello(json!({"rover_id": "r1", "rover_data": {"mobility": ["wheels"]}})),
            &ctx.stream,
        )
        .unwrap();
        let session = RoverSession::start(&ctx, identity, RoverLink::new(proxy), "").unwrap();

        session
            .apply_tracking(&TrackingCommand::TrackCustom(
                crate::geometry::BoundingBox::new(2.0, 2.0, 4.0, 4.0),
            ))
            .unwrap();
        session
            .apply_tracking(&TrackingCommand::Follow {
                wheels: true,
                camera: true,
            })
            .unwrap();
        assert_eq!(session.following(), (true, false));
        session.shutdown();
    }

    #[test]
    fn restart_capture_rewrites_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let (proxy, _rover) = socket_pair();
        let identity = RoverIdentity::from_hello(
            hello(json!({"rover_id": "cam", "rover_data": {}})),
            &ctx.stream,
        )
        .unwrap();
        let session = RoverSession::start(&ctx, identity, RoverLink::new(proxy), "old").unwrap();

        session.restart_capture("new").unwrap();
        assert_eq!(fs::read_to_string(session.conf_path()).unwrap(), "new");

        session.shutdown();
        assert!(matches!(
            session.restart_capture("late"),
            Err(ProxyError::SessionClosed)
        ));
        assert_eq!(fs::read_to_string(session.conf_path()).unwrap(), "new");
    }
}

//! The three listeners (rover, control, stream), the process-scoped rover
//! registry they share, and the foreground daemon loop.

mod control;
mod rover;
mod stream;
mod ws;

use anyhow::Context;
use log::{error, info, warn};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    collections::HashMap,
    io::ErrorKind,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::config::{ProxyConfig, ServerConfig};
use crate::error::{ProxyError, Result};
use crate::media::{MediaFactory, ProcessMedia};
use crate::protocol::RoverListing;
use crate::session::{RoverSession, SessionContext};
use crate::vision::{StaticVision, VisionBackend};
use ws::WsPeer;

const ACCEPT_POLL: Duration = Duration::from_millis(5);

/// rover_id -> live session. The only state shared across rovers.
pub struct RoverHub {
    server_id: String,
    sessions: Mutex<HashMap<String, Arc<RoverSession>>>,
}

impl Default for RoverHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RoverHub {
    pub fn new() -> Self {
        Self {
            server_id: uuid::Uuid::new_v4().to_string(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Register `session`, returning whatever was registered under its id.
    pub fn insert(&self, session: Arc<RoverSession>) -> Option<Arc<RoverSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.rover_id().to_string(), session)
    }

    pub fn take(&self, rover_id: &str) -> Option<Arc<RoverSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(rover_id)
    }

    pub fn lookup(&self, rover_id: &str) -> Result<Arc<RoverSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(rover_id)
            .filter(|s| s.is_alive())
            .cloned()
            .ok_or_else(|| ProxyError::UnknownRover(rover_id.to_string()))
    }

    /// Drop the entry for `session` unless a newer session took its id.
    pub fn remove_if_same(&self, session: &Arc<RoverSession>) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(session.rover_id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session.rover_id());
                true
            }
            _ => false,
        }
    }

    pub fn listings(&self) -> Vec<RoverListing> {
        let mut out: Vec<RoverListing> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.is_alive())
            .map(|s| s.identity().listing())
            .collect();
        out.sort_by(|a, b| a.rover_id.cmp(&b.rover_id));
        out
    }

    pub fn shutdown_all(&self) {
        let drained: Vec<Arc<RoverSession>> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in drained {
            session.shutdown();
        }
    }
}

/// The three bound listening sockets. Binding is the one fatal step.
pub struct Listeners {
    rover: TcpListener,
    control: TcpListener,
    stream: TcpListener,
}

impl Listeners {
    pub fn bind(cfg: &ServerConfig) -> anyhow::Result<Self> {
        let bind = |role: &str, port: u16| {
            TcpListener::bind((cfg.bind.as_str(), port))
                .with_context(|| format!("failed to bind {role} listener on {}:{port}", cfg.bind))
        };
        Ok(Self {
            rover: bind("rover", cfg.rover_port)?,
            control: bind("control", cfg.control_port)?,
            stream: bind("stream", cfg.stream_port)?,
        })
    }

    /// `(rover, control, stream)` local addresses.
    pub fn addrs(&self) -> std::io::Result<(SocketAddr, SocketAddr, SocketAddr)> {
        Ok((
            self.rover.local_addr()?,
            self.control.local_addr()?,
            self.stream.local_addr()?,
        ))
    }
}

pub struct ProxyServer {
    hub: Arc<RoverHub>,
    ctx: Arc<SessionContext>,
    magic: [u8; 4],
    write_timeout: Duration,
    poll: Duration,
    running: Arc<AtomicBool>,
    acceptors: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyServer {
    pub fn new(
        cfg: &ProxyConfig,
        media: Arc<dyn MediaFactory>,
        vision: Arc<dyn VisionBackend>,
    ) -> Self {
        Self {
            hub: Arc::new(RoverHub::new()),
            ctx: Arc::new(SessionContext {
                media,
                vision,
                stream: cfg.stream.clone(),
                follow: cfg.follow.clone(),
            }),
            magic: cfg.magic_bytes(),
            write_timeout: Duration::from_millis(cfg.server.client_write_timeout_ms.max(1)),
            poll: Duration::from_millis(cfg.server.client_poll_ms.max(1)),
            running: Arc::new(AtomicBool::new(false)),
            acceptors: Mutex::new(Vec::new()),
        }
    }

    pub fn hub(&self) -> &Arc<RoverHub> {
        &self.hub
    }

    pub fn start(&self, listeners: Listeners) -> Result<()> {
        self.running.store(true, Ordering::Release);
        let (rover_addr, control_addr, stream_addr) = listeners.addrs()?;

        let (hub, ctx, write_timeout) = (self.hub.clone(), self.ctx.clone(), self.write_timeout);
        let rover_acceptor = self.spawn_acceptor("rover", listeners.rover, move |s| {
            if let Err(e) = rover::handle_rover(s, &hub, &ctx, write_timeout) {
                warn!("rover: {e}");
            }
        })?;
        info!("rover listener on {rover_addr}");

        let (hub, poll) = (self.hub.clone(), self.poll);
        let control_acceptor = self.spawn_acceptor("control", listeners.control, move |s| {
            let outcome = WsPeer::accept(s, write_timeout, poll)
                .and_then(|peer| control::handle_control(peer, &hub));
            if let Err(e) = outcome {
                warn!("control: {e}");
            }
        })?;
        info!("control listener on ws://{control_addr}");

        let (hub, magic) = (self.hub.clone(), self.magic);
        let stream_acceptor = self.spawn_acceptor("stream", listeners.stream, move |s| {
            let outcome = WsPeer::accept(s, write_timeout, poll)
                .and_then(|peer| stream::handle_stream(peer, &hub, magic));
            if let Err(e) = outcome {
                warn!("stream: {e}");
            }
        })?;
        info!("stream listener on ws://{stream_addr}");

        self.acceptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([rover_acceptor, control_acceptor, stream_acceptor]);
        Ok(())
    }

    fn spawn_acceptor<F>(
        &self,
        role: &'static str,
        listener: TcpListener,
        handler: F,
    ) -> Result<JoinHandle<()>>
    where
        F: Fn(TcpStream) + Send + Sync + 'static,
    {
        listener.set_nonblocking(true)?;
        let running = self.running.clone();
        let handler = Arc::new(handler);
        let handle = thread::Builder::new()
            .name(format!("{role}-listener"))
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            let handler = handler.clone();
                            let spawned = thread::Builder::new()
                                .name(format!("{role}-client"))
                                .spawn(move || handler(stream));
                            if let Err(e) = spawned {
                                error!("{role}: cannot spawn client thread: {e}");
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                        Err(e) => {
                            warn!("{role}: accept failed: {e}");
                            thread::sleep(ACCEPT_POLL);
                        }
                    }
                }
            })?;
        Ok(handle)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let acceptors: Vec<JoinHandle<()>> = self
            .acceptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in acceptors {
            let _ = handle.join();
        }
        self.hub.shutdown_all();
    }
}

pub fn run_daemon(cfg: ProxyConfig) -> anyhow::Result<()> {
    let listeners = Listeners::bind(&cfg.server)?;
    let media = Arc::new(ProcessMedia {
        capture: cfg.capture.clone(),
        transcoder: cfg.transcoder.clone(),
    });
    let server = ProxyServer::new(&cfg, media, Arc::new(StaticVision));
    server.start(listeners)?;
    info!("daemon: server id {}", server.hub().server_id());

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("failed to install signal handlers")?;
    if let Some(sig) = signals.forever().next() {
        info!("daemon: received signal {sig}; shutting down");
    }
    server.stop();
    info!("daemon: stopped");
    Ok(())
}

// client helper
fn client_request<S: std::io::Read + std::io::Write>(
    ws: &mut tungstenite::WebSocket<S>,
    req: serde_json::Value,
) -> anyhow::Result<serde_json::Value> {
    ws.send(tungstenite::Message::Text(req.to_string()))?;
    loop {
        match ws.read()? {
            tungstenite::Message::Text(t) => return Ok(serde_json::from_str(&t)?),
            tungstenite::Message::Close(_) => {
                return Err(anyhow::anyhow!("proxy closed the connection"));
            }
            _ => continue,
        }
    }
}

/// Say hello to a running proxy's control listener and fetch its rover list.
pub fn list_rovers(addr: &str) -> anyhow::Result<serde_json::Value> {
    let (mut ws, _) = tungstenite::connect(format!("ws://{addr}"))
        .with_context(|| format!("rover-proxy is not reachable at ws://{addr}"))?;
    let client_id = uuid::Uuid::new_v4().to_string();
    let ack = client_request(&mut ws, serde_json::json!({"client_id": client_id, "cmd": "hello"}))?;
    if ack.get("msg").and_then(|m| m.as_str()) != Some("ack") {
        return Err(anyhow::anyhow!("unexpected hello reply: {ack}"));
    }
    let rovers = client_request(&mut ws, serde_json::json!({"client_id": client_id, "cmd": "list"}))?;
    let _ = ws.close(None);
    Ok(rovers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::stream_header;
    use crate::session::tests::SyntheticMedia;
    use serde_json::{Value, json};
    use std::io::{BufRead, BufReader, Write};
    use std::net::Shutdown;
    use std::time::Instant;
    use tungstenite::{Message, WebSocket, stream::MaybeTlsStream};

    type Client = WebSocket<MaybeTlsStream<TcpStream>>;

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

    fn ws_connect(addr: SocketAddr) -> Client {
        let (ws, _) = tungstenite::connect(format!("ws://{addr}")).unwrap();
        if let MaybeTlsStream::Plain(s) = ws.get_ref() {
            s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        }
        ws
    }

    fn send(ws: &mut Client, v: Value) {
        ws.send(Message::Text(v.to_string())).unwrap();
    }

    fn recv_json(ws: &mut Client) -> Value {
        loop {
            if let Message::Text(t) = ws.read().unwrap() {
                return serde_json::from_str(&t).unwrap();
            }
        }
    }

    fn recv_binary(ws: &mut Client) -> Vec<u8> {
        loop {
            if let Message::Binary(b) = ws.read().unwrap() {
                return b;
            }
        }
    }

    fn test_config(conf_dir: &std::path::Path) -> ProxyConfig {
        let mut cfg = ProxyConfig::default();
        cfg.server.bind = "127.0.0.1".into();
        cfg.server.rover_port = 0;
        cfg.server.control_port = 0;
        cfg.server.stream_port = 0;
        cfg.stream.chunk_size = 64;
        cfg.stream.conf_dir = conf_dir.to_path_buf();
        cfg
    }

    #[test]
    fn hub_lookup_and_listing_follow_liveness() {
        let hub = RoverHub::new();
        assert!(matches!(hub.lookup("x"), Err(ProxyError::UnknownRover(_))));
        assert!(hub.listings().is_empty());
        assert!(!hub.server_id().is_empty());
        assert_ne!(hub.server_id(), RoverHub::new().server_id());
    }

    #[test]
    fn binding_a_taken_port_fails() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut cfg = ServerConfig {
            bind: "127.0.0.1".into(),
            ..ServerConfig::default()
        };
        cfg.rover_port = taken.local_addr().unwrap().port();
        cfg.control_port = 0;
        cfg.stream_port = 0;
        assert!(Listeners::bind(&cfg).is_err());
    }

    #[test]
    fn rover_viewer_and_controller_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let listeners = Listeners::bind(&cfg.server).unwrap();
        let (rover_addr, control_addr, stream_addr) = listeners.addrs().unwrap();
        let server = ProxyServer::new(&cfg, Arc::new(SyntheticMedia), Arc::new(StaticVision));
        server.start(listeners).unwrap();
        let hub = server.hub().clone();

        // rover registers
        let mut rover = TcpStream::connect(rover_addr).unwrap();
        rover.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let hello = json!({"rover_id": "r1", "rover_data": {
            "description": "test rover", "fov": 62.2, "mobility": ["wheels"],
            "stream_size": [8, 8], "framerate": 50}});
        writeln!(rover, "{hello}").unwrap();
        writeln!(rover, "{}", json!({"rover_id": "r1", "cmd": "set_stream", "conf": "v=0"})).unwrap();
        assert!(wait_for(|| hub.lookup("r1").is_ok()));
        assert!(dir.path().join("r1.sdp").exists());

        // viewer gets the header then video
        let mut viewer = ws_connect(stream_addr);
        send(&mut viewer, json!({"client_id": "v1", "rover_id": "r1", "cmd": "connect"}));
        let ack = recv_json(&mut viewer);
        assert_eq!(ack["msg"], "ok");
        assert_eq!(ack["rover_id"], "r1");
        assert_eq!(ack["server_id"], hub.server_id());
        assert_eq!(recv_binary(&mut viewer), stream_header(*b"jsmp", 8, 8).to_vec());
        let chunk = recv_binary(&mut viewer);
        assert!(!chunk.is_empty() && chunk.len() <= 64);

        // controller handshake
        let mut ctl = ws_connect(control_addr);
        send(&mut ctl, json!({"client_id": "c1", "cmd": "list"}));
        assert_eq!(recv_json(&mut ctl), json!({"msg": "failed", "info": "unknown_cmd"}));
        send(&mut ctl, json!({"client_id": "c1", "cmd": "hello"}));
        assert_eq!(
            recv_json(&mut ctl),
            json!({"server_id": hub.server_id(), "msg": "ack"})
        );
        send(&mut ctl, json!({"client_id": "c1", "cmd": "list"}));
        let list = recv_json(&mut ctl);
        assert_eq!(list["rovers"][0]["rover_id"], "r1");
        assert_eq!(list["rovers"][0]["rover_data"]["description"], "test rover");
        send(&mut ctl, json!({"client_id": "c1", "rover_id": "nope", "cmd": "connect"}));
        assert_eq!(recv_json(&mut ctl), json!({"msg": "failed", "info": "unknown_rover"}));
        send(&mut ctl, json!({"client_id": "c1", "rover_id": "r1", "cmd": "connect"}));
        assert_eq!(recv_json(&mut ctl)["msg"], "ok");

        // rover commands are validated, then forwarded
        send(&mut ctl, json!({"cmd": "move", "params": {"direction": ["forward", "back"]}}));
        assert_eq!(recv_json(&mut ctl), json!({"msg": "failed", "info": "bad_direction"}));
        send(&mut ctl, json!({"cmd": "move", "params": {"direction": ["forward"]}}));
        assert_eq!(recv_json(&mut ctl), json!({"msg": "ok"}));
        let mut lines = BufReader::new(rover.try_clone().unwrap());
        let mut line = String::new();
        lines.read_line(&mut line).unwrap();
        let forwarded: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(forwarded, json!({"cmd": "move", "params": {"direction": ["forward"]}}));

        // tracking commands stay local; the rover has no gimbal
        send(&mut ctl, json!({"cmd": "track_custom", "params": {"roi": [2, 2, 4, 4]}}));
        assert_eq!(recv_json(&mut ctl), json!({"msg": "ok"}));
        send(&mut ctl, json!({"cmd": "follow", "params": {"wheels": true, "cam": true}}));
        assert_eq!(recv_json(&mut ctl), json!({"msg": "ok"}));
        assert_eq!(hub.lookup("r1").unwrap().following(), (true, false));

        // rover-side failures reach the controller
        writeln!(rover, "{}", json!({"msg": "failed", "info": "blocked"})).unwrap();
        assert_eq!(recv_json(&mut ctl), json!({"msg": "failed", "info": "blocked"}));

        // rover leaves: viewers stop, the id stops resolving
        rover.shutdown(Shutdown::Both).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match viewer.read() {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => assert!(Instant::now() < deadline, "viewer never closed"),
            }
        }
        assert!(wait_for(|| hub.lookup("r1").is_err()));

        let mut late = ws_connect(stream_addr);
        send(&mut late, json!({"client_id": "v2", "rover_id": "r1", "cmd": "connect"}));
        assert_eq!(recv_json(&mut late), json!({"msg": "failed", "info": "unknown_rover"}));

        server.stop();
    }

    #[test]
    fn reregistering_rover_replaces_the_old_session() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let listeners = Listeners::bind(&cfg.server).unwrap();
        let (rover_addr, _, _) = listeners.addrs().unwrap();
        let server = ProxyServer::new(&cfg, Arc::new(SyntheticMedia), Arc::new(StaticVision));
        server.start(listeners).unwrap();
        let hub = server.hub().clone();

        let register = || {
            let mut rover = TcpStream::connect(rover_addr).unwrap();
            let hello = json!({"rover_id": "dup", "rover_data": {"stream_size": [4, 4]}});
            writeln!(rover, "{hello}").unwrap();
            writeln!(rover, "{}", json!({"cmd": "set_stream", "conf": ""})).unwrap();
            rover
        };

        let _first = register();
        assert!(wait_for(|| hub.lookup("dup").is_ok()));
        let old = hub.lookup("dup").unwrap();

        let _second = register();
        assert!(wait_for(|| !old.is_alive()));
        assert!(wait_for(|| hub
            .lookup("dup")
            .map(|s| !Arc::ptr_eq(&s, &old))
            .unwrap_or(false)));
        assert_eq!(hub.listings().len(), 1);

        server.stop();
        assert!(hub.lookup("dup").is_err());
    }

    #[test]
    fn list_helper_talks_to_the_control_listener() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let listeners = Listeners::bind(&cfg.server).unwrap();
        let (_, control_addr, _) = listeners.addrs().unwrap();
        let server = ProxyServer::new(&cfg, Arc::new(SyntheticMedia), Arc::new(StaticVision));
        server.start(listeners).unwrap();

        let v = list_rovers(&control_addr.to_string()).unwrap();
        assert_eq!(v["server_id"], server.hub().server_id());
        assert_eq!(v["rovers"], json!([]));

        server.stop();
    }

    #[test]
    fn malformed_rover_hello_is_answered_and_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let listeners = Listeners::bind(&cfg.server).unwrap();
        let (rover_addr, _, _) = listeners.addrs().unwrap();
        let server = ProxyServer::new(&cfg, Arc::new(SyntheticMedia), Arc::new(StaticVision));
        server.start(listeners).unwrap();

        let mut rover = TcpStream::connect(rover_addr).unwrap();
        rover.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        writeln!(rover, "this is not json").unwrap();
        let mut line = String::new();
        BufReader::new(rover).read_line(&mut line).unwrap();
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v, json!({"msg": "failed", "info": "parsing_error"}));
        assert!(server.hub().listings().is_empty());

        server.stop();
    }

    #[test]
    fn rover_admin_commands_on_a_live_connection() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let listeners = Listeners::bind(&cfg.server).unwrap();
        let (rover_addr, _, _) = listeners.addrs().unwrap();
        let server = ProxyServer::new(&cfg, Arc::new(SyntheticMedia), Arc::new(StaticVision));
        server.start(listeners).unwrap();
        let hub = server.hub().clone();

        let mut rover = TcpStream::connect(rover_addr).unwrap();
        rover.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let hello = json!({"rover_id": "adm", "rover_data": {"stream_size": [4, 4]}});
        writeln!(rover, "{hello}").unwrap();
        writeln!(rover, "{}", json!({"cmd": "set_stream", "conf": "v=0"})).unwrap();
        assert!(wait_for(|| hub.lookup("adm").is_ok()));
        let session = hub.lookup("adm").unwrap();
        let sdp = dir.path().join("adm.sdp");

        let mut replies = BufReader::new(rover.try_clone().unwrap());
        let mut next_reply = || {
            let mut line = String::new();
            replies.read_line(&mut line).unwrap();
            serde_json::from_str::<Value>(&line).unwrap()
        };

        // descriptor rewritten and capture restarted in place
        writeln!(rover, "{}", json!({"cmd": "set_stream", "conf": "v=1"})).unwrap();
        assert!(wait_for(|| std::fs::read_to_string(&sdp).ok().as_deref() == Some("v=1")));
        assert!(session.is_alive());

        writeln!(rover, "{}", json!({"cmd": "set_stream"})).unwrap();
        assert_eq!(next_reply(), json!({"msg": "failed", "info": "bad_params"}));
        writeln!(rover, "{}", json!({"cmd": "dance"})).unwrap();
        assert_eq!(next_reply(), json!({"msg": "failed", "info": "unknown_cmd"}));
        writeln!(rover, "not json at all").unwrap();
        assert_eq!(next_reply(), json!({"msg": "failed", "info": "parsing_error"}));
        writeln!(rover, "{}", json!({"rover_id": "adm"})).unwrap();
        assert_eq!(next_reply(), json!({"msg": "failed", "info": "parsing_error"}));
        assert!(session.is_alive());

        // bye tears the session down and closes the connection
        writeln!(rover, "{}", json!({"cmd": "bye"})).unwrap();
        assert!(wait_for(|| !session.is_alive()));
        assert!(wait_for(|| hub.lookup("adm").is_err()));
        let mut rest = String::new();
        assert_eq!(BufReader::new(rover).read_line(&mut rest).unwrap(), 0);

        server.stop();
    }
}

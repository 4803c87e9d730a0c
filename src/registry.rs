//! Per-rover client bookkeeping: control clients and stream viewers.

use log::info;
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use crate::error::Result;

pub trait PeerSink: Send {
    fn send_binary(&mut self, data: &[u8]) -> Result<()>;
    fn send_text(&mut self, text: &str) -> Result<()>;
    fn close(&mut self);
}

impl<P: PeerSink + ?Sized> PeerSink for Box<P> {
    fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        (**self).send_binary(data)
    }
    fn send_text(&mut self, text: &str) -> Result<()> {
        (**self).send_text(text)
    }
    fn close(&mut self) {
        (**self).close()
    }
}

pub struct ClientRegistry<P: PeerSink> {
    rover_id: String,
    control: Mutex<HashMap<String, P>>,
    stream: Mutex<HashMap<String, P>>,
}

/// Send to every peer; peers whose send failed are dropped after the pass.
fn broadcast<P: PeerSink>(
    peers: &Mutex<HashMap<String, P>>,
    mut send: impl FnMut(&mut P) -> Result<()>,
) -> Vec<String> {
    let mut peers = peers.lock().unwrap_or_else(PoisonError::into_inner);
    let mut dead = Vec::new();
    for (id, peer) in peers.iter_mut() {
        if send(peer).is_err() {
            dead.push(id.clone());
        }
    }
    for id in &dead {
        if let Some(mut p) = peers.remove(id) {
            p.close();
        }
    }
    dead
}

fn take<P: PeerSink>(peers: &Mutex<HashMap<String, P>>, id: &str) -> bool {
    let old = peers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(id);
    match old {
        Some(mut p) => {
            p.close();
            true
        }
        None => false,
    }
}

fn insert<P: PeerSink>(peers: &Mutex<HashMap<String, P>>, id: &str, peer: P) {
    let old = peers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(id.to_string(), peer);
    if let Some(mut old) = old {
        old.close();
    }
}

impl<P: PeerSink> ClientRegistry<P> {
    pub fn new(rover_id: &str) -> Self {
        Self {
            rover_id: rover_id.to_string(),
            control: Mutex::new(HashMap::new()),
            stream: Mutex::new(HashMap::new()),
        }
    }

    /// Register a control client. A previous peer under the same id is closed.
    pub fn add_control_client(&self, id: &str, peer: P) {
        insert(&self.control, id, peer);
        info!("rover {}: control client {id} added", self.rover_id);
    }

    pub fn add_stream_client(&self, id: &str, peer: P) {
        insert(&self.stream, id, peer);
        info!("rover {}: stream client {id} added", self.rover_id);
    }

    /// Forget `id` in both roles. Returns whether anything was removed.
    pub fn remove(&self, id: &str) -> bool {
        let control = self.remove_control(id);
        self.remove_stream(id) || control
    }

    pub fn remove_control(&self, id: &str) -> bool {
        take(&self.control, id)
    }

    pub fn remove_stream(&self, id: &str) -> bool {
        take(&self.stream, id)
    }

    pub fn broadcast_stream(&self, chunk: &[u8]) -> Vec<String> {
        broadcast(&self.stream, |p| p.send_binary(chunk))
    }

    pub fn broadcast_control(&self, text: &str) -> Vec<String> {
        broadcast(&self.control, |p| p.send_text(text))
    }

    pub fn stream_count(&self) -> usize {
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn control_count(&self) -> usize {
        self.control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn close_all(&self) {
        for peers in [&self.control, &self.stream] {
            let drained: Vec<P> = peers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain()
                .map(|(_, p)| p)
                .collect();
            for mut p in drained {
                p.close();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ProxyError;
    use std::sync::Arc;

    #[derive(Default)]
    pub(crate) struct Inbox {
        pub binary: Vec<Vec<u8>>,
        pub text: Vec<String>,
        pub closed: bool,
    }

    #[derive(Clone)]
    pub(crate) struct FakePeer {
        pub inbox: Arc<Mutex<Inbox>>,
        pub broken: bool,
    }

    impl FakePeer {
        pub(crate) fn new(broken: bool) -> Self {
            Self {
                inbox: Arc::new(Mutex::new(Inbox::default())),
                broken,
            }
        }
    }

    impl PeerSink for FakePeer {
        fn send_binary(&mut self, data: &[u8]) -> Result<()> {
            if self.broken {
                return Err(ProxyError::SessionClosed);
            }
            self.inbox.lock().unwrap().binary.push(data.to_vec());
            Ok(())
        }
        fn send_text(&mut self, text: &str) -> Result<()> {
            if self.broken {
                return Err(ProxyError::SessionClosed);
            }
            self.inbox.lock().unwrap().text.push(text.to_string());
            Ok(())
        }
        fn close(&mut self) {
            self.inbox.lock().unwrap().closed = true;
        }
    }

    #[test]
    fn broadcast_drops_exactly_the_failing_peers() {
        let reg = ClientRegistry::new("r1");
        let mut healthy = Vec::new();
        let mut broken = Vec::new();
        for i in 0..5 {
            let p = FakePeer::new(i % 2 == 1);
            if p.broken {
                broken.push((format!("c{i}"), p.clone()));
            } else {
                healthy.push(p.clone());
            }
            reg.add_stream_client(&format!("c{i}"), p);
        }

        let mut dropped = reg.broadcast_stream(b"chunk");
        dropped.sort();
        let mut expected: Vec<String> = broken.iter().map(|(id, _)| id.clone()).collect();
        expected.sort();
        assert_eq!(dropped, expected);
        assert_eq!(reg.stream_count(), 3);

        for p in &healthy {
            assert_eq!(p.inbox.lock().unwrap().binary, vec![b"chunk".to_vec()]);
        }
        for (_, p) in &broken {
            assert!(p.inbox.lock().unwrap().closed);
        }

        assert!(reg.broadcast_stream(b"next").is_empty());
    }

    #[test]
    fn control_and_stream_roles_are_separate() {
        let reg = ClientRegistry::new("r1");
        let ctl = FakePeer::new(false);
        let view = FakePeer::new(false);
        reg.add_control_client("a", ctl.clone());
        reg.add_stream_client("b", view.clone());

        reg.broadcast_control("{\"msg\":\"failed\"}");
        reg.broadcast_stream(b"v");
        assert_eq!(ctl.inbox.lock().unwrap().text.len(), 1);
        assert!(ctl.inbox.lock().unwrap().binary.is_empty());
        assert!(view.inbox.lock().unwrap().text.is_empty());

        assert!(!reg.remove_stream("a"));
        assert!(reg.remove("a"));
        assert!(!reg.remove("a"));
        assert_eq!(reg.control_count(), 0);
        assert_eq!(reg.stream_count(), 1);
    }

    #[test]
    fn reusing_an_id_closes_the_old_peer() {
        let reg = ClientRegistry::new("r1");
        let first = FakePeer::new(false);
        reg.add_stream_client("same", first.clone());
        reg.add_stream_client("same", FakePeer::new(false));
        assert!(first.inbox.lock().unwrap().closed);
        assert_eq!(reg.stream_count(), 1);
    }

    #[test]
    fn close_all_empties_both_roles() {
        let reg = ClientRegistry::new("r1");
        let p = FakePeer::new(false);
        reg.add_control_client("a", p.clone());
        reg.add_stream_client("b", FakePeer::new(false));
        reg.close_all();
        assert_eq!(reg.control_count() + reg.stream_count(), 0);
        assert!(p.inbox.lock().unwrap().closed);
    }
}

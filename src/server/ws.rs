use log::debug;
use std::{
    io::ErrorKind,
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tungstenite::{Message, WebSocket};

use crate::error::{ProxyError, Result};
use crate::registry::PeerSink;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, PartialEq, Eq)]
pub enum Incoming {
    Text(String),
    /// Nothing arrived within the poll interval.
    Idle,
    Closed,
}

/// Server side of one WebSocket client. Clones share the socket, so the
/// connection handler can keep reading while a registry holds a clone for
/// broadcasts.
#[derive(Clone)]
pub struct WsPeer {
    addr: SocketAddr,
    ws: Arc<Mutex<WebSocket<TcpStream>>>,
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

impl WsPeer {
    /// Run the upgrade handshake, then arm the write timeout (slow clients
    /// fail their send) and the read poll interval.
    pub fn accept(stream: TcpStream, write_timeout: Duration, poll: Duration) -> Result<Self> {
        let addr = stream.peer_addr()?;
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        let ws = tungstenite::accept(stream)
            .map_err(|e| ProxyError::Handshake(format!("{addr}: {e}")))?;
        ws.get_ref().set_write_timeout(Some(write_timeout))?;
        ws.get_ref().set_read_timeout(Some(poll))?;
        debug!("ws: upgraded {addr}");
        Ok(Self {
            addr,
            ws: Arc::new(Mutex::new(ws)),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn recv(&self) -> Result<Incoming> {
        let mut ws = self.ws.lock().unwrap_or_else(PoisonError::into_inner);
        match ws.read() {
            Ok(Message::Text(text)) => Ok(Incoming::Text(text)),
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => Ok(Incoming::Text(text)),
                Err(_) => {
                    debug!("ws: {} sent non-UTF-8 binary; ignored", self.addr);
                    Ok(Incoming::Idle)
                }
            },
            Ok(Message::Close(_)) => Ok(Incoming::Closed),
            Ok(_) => Ok(Incoming::Idle),
            Err(tungstenite::Error::Io(e)) if is_timeout(&e) => Ok(Incoming::Idle),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(Incoming::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn recv_blocking(&self) -> Result<Option<String>> {
        loop {
            match self.recv()? {
                Incoming::Text(text) => return Ok(Some(text)),
                Incoming::Idle => continue,
                Incoming::Closed => return Ok(None),
            }
        }
    }

    pub fn send_json(&self, v: &serde_json::Value) -> Result<()> {
        self.send(Message::Text(v.to_string()))
    }

    fn send(&self, msg: Message) -> Result<()> {
        let mut ws = self.ws.lock().unwrap_or_else(PoisonError::into_inner);
        ws.send(msg)?;
        Ok(())
    }

    pub fn shutdown(&self) {
        let mut ws = self.ws.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = ws.close(None);
        let _ = ws.flush();
        let _ = ws.get_ref().shutdown(Shutdown::Both);
    }
}

impl PeerSink for WsPeer {
    fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.send(Message::Binary(data.to_vec()))
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        self.send(Message::Text(text.to_string()))
    }

    fn close(&mut self) {
        self.shutdown();
    }
}

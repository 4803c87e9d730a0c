use log::{debug, info, warn};
use serde_json::Value;
use std::{
    io::{BufRead, BufReader},
    net::TcpStream,
    sync::Arc,
    time::Duration,
};

use super::RoverHub;
use crate::error::{ProxyError, Reason, Result};
use crate::protocol::{Reply, RoverHello, RoverReply, SetStream};
use crate::session::{RoverIdentity, RoverLink, RoverSession, SessionContext};

fn read_line(reader: &mut impl BufRead) -> Result<Option<String>> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            return Ok(Some(line));
        }
    }
}

fn fail(link: &RoverLink, reason: Reason) {
    if let Err(e) = link.send_json(&Reply::Failed { info: reason }.to_json()) {
        debug!("rover: could not send {reason}: {e}");
    }
}

/// Read a handshake line of type `T`, answering `parsing_error` on garbage.
fn handshake_line<T: serde::de::DeserializeOwned>(
    reader: &mut impl BufRead,
    link: &RoverLink,
    what: &str,
) -> Result<T> {
    let line = read_line(reader)?
        .ok_or_else(|| ProxyError::Handshake(format!("closed before {what}")))?;
    serde_json::from_str(&line).map_err(|e| {
        fail(link, Reason::ParsingError);
        ProxyError::Handshake(format!("bad {what}: {e}"))
    })
}

pub(super) fn handle_rover(
    stream: TcpStream,
    hub: &RoverHub,
    ctx: &SessionContext,
    write_timeout: Duration,
) -> Result<()> {
    let addr = stream.peer_addr()?;
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(write_timeout))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let link = RoverLink::new(stream);
    info!("rover: connection from {addr}");

    let hello: RoverHello = handshake_line(&mut reader, &link, "hello")?;
    let identity = match RoverIdentity::from_hello(hello, &ctx.stream) {
        Ok(identity) => identity,
        Err(e) => {
            fail(&link, Reason::BadParams);
            return Err(e);
        }
    };
    let set_stream: SetStream = handshake_line(&mut reader, &link, "set_stream")?;
    if set_stream.cmd != "set_stream" {
        warn!("rover: {addr} sent {:?} instead of set_stream", set_stream.cmd);
        fail(&link, Reason::UnknownCmd);
        return Err(Reason::UnknownCmd.into());
    }

    let rover_id = identity.rover_id.clone();
    if let Some(old) = hub.take(&rover_id) {
        info!("rover {rover_id}: re-registered from {addr}; replacing old session");
        old.shutdown();
    }
    let session = RoverSession::start(ctx, identity, link, &set_stream.conf)?;
    if let Some(raced) = hub.insert(session.clone()) {
        raced.shutdown();
    }
    info!("rover {rover_id}: registered from {addr}");

    loop {
        let line = match read_line(&mut reader) {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                if session.is_alive() {
                    warn!("rover {rover_id}: read failed: {e}");
                }
                break;
            }
        };
        if handle_message(&session, &line) == Flow::Close {
            break;
        }
    }

    info!("rover {rover_id}: disconnected");
    hub.remove_if_same(&session);
    session.shutdown();
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

fn handle_message(session: &Arc<RoverSession>, line: &str) -> Flow {
    let rover_id = session.rover_id();
    let Ok(v) = serde_json::from_str::<Value>(line) else {
        warn!("rover {rover_id}: unparsable line {:?}", line.trim());
        fail(session.link(), Reason::ParsingError);
        return Flow::Continue;
    };

    if v.get("msg").is_some() {
        match serde_json::from_value::<RoverReply>(v.clone()) {
            Ok(reply) if reply.msg == "ok" => debug!("rover {rover_id}: ok"),
            Ok(reply) => {
                let info = reply.info.as_deref().unwrap_or("?");
                warn!("rover {rover_id}: command {}: {info}", reply.msg);
                session.relay_to_controllers(&v.to_string());
            }
            Err(e) => warn!("rover {rover_id}: malformed reply: {e}"),
        }
        return Flow::Continue;
    }

    match v.get("cmd").and_then(Value::as_str) {
        Some("set_stream") => match serde_json::from_value::<SetStream>(v.clone()) {
            Ok(s) => {
                if let Err(e) = session.restart_capture(&s.conf) {
                    warn!("rover {rover_id}: capture restart failed: {e}");
                }
            }
            Err(_) => fail(session.link(), Reason::BadParams),
        },
        Some("bye") => {
            info!("rover {rover_id}: said bye");
            return Flow::Close;
        }
        Some(other) => {
            warn!("rover {rover_id}: unsupported command {other:?}");
            fail(session.link(), Reason::UnknownCmd);
        }
        None => fail(session.link(), Reason::ParsingError),
    }
    Flow::Continue
}

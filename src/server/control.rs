use log::{debug, info, warn};
use std::sync::Arc;

use super::RoverHub;
use super::ws::{Incoming, WsPeer};
use crate::error::{Reason, Result};
use crate::protocol::{
    ClientCommand, ClientRequest, Reply, connect_ok, hello_ack, parse_command, rover_list,
};
use crate::session::RoverSession;

enum Phase {
    AwaitHello,
    Greeted,
    Connected {
        session: Arc<RoverSession>,
        client_id: String,
    },
}

fn reply(peer: &WsPeer, r: Reply) -> Result<()> {
    peer.send_json(&r.to_json())
}

fn failed(peer: &WsPeer, info: Reason) -> Result<()> {
    reply(peer, Reply::Failed { info })
}

/// Serve one control client: hello, any number of lists, connect, then
/// commands until either side goes away.
pub(super) fn handle_control(peer: WsPeer, hub: &RoverHub) -> Result<()> {
    let addr = peer.addr();
    info!("control: client connected from {addr}");
    let mut phase = Phase::AwaitHello;

    let result = loop {
        if let Phase::Connected { session, .. } = &phase {
            if !session.is_alive() {
                let _ = failed(&peer, Reason::UnknownRover);
                break Ok(());
            }
        }
        let text = match peer.recv() {
            Ok(Incoming::Text(text)) => text,
            Ok(Incoming::Idle) => continue,
            Ok(Incoming::Closed) => break Ok(()),
            Err(e) => break Err(e),
        };
        let step = match &phase {
            Phase::Connected { session, .. } => on_command(&peer, session, &text).map(|_| None),
            _ => on_handshake(&peer, hub, &phase, &text),
        };
        match step {
            Ok(Some(next)) => phase = next,
            Ok(None) => {}
            Err(e) => break Err(e),
        }
    };

    if let Phase::Connected { session, client_id } = &phase {
        session.remove_control_client(client_id);
    }
    peer.shutdown();
    info!("control: client {addr} disconnected");
    result
}

fn on_handshake(
    peer: &WsPeer,
    hub: &RoverHub,
    phase: &Phase,
    text: &str,
) -> Result<Option<Phase>> {
    let Ok(req) = serde_json::from_str::<ClientRequest>(text) else {
        failed(peer, Reason::ParsingError)?;
        return Ok(None);
    };
    let greeted = matches!(phase, Phase::Greeted);

    match (req.cmd.as_deref(), greeted) {
        (Some("hello"), _) => {
            debug!("control: hello from {:?}", req.client_id);
            peer.send_json(&hello_ack(hub.server_id()))?;
            Ok(Some(Phase::Greeted))
        }
        (Some("list"), true) => {
            peer.send_json(&rover_list(hub.server_id(), &hub.listings()))?;
            Ok(None)
        }
        (Some("connect"), true) => {
            let rover_id = req.rover_id.unwrap_or_default();
            let session = match hub.lookup(&rover_id) {
                Ok(s) => s,
                Err(e) => {
                    warn!("control: connect refused: {e}");
                    failed(peer, Reason::UnknownRover)?;
                    return Ok(None);
                }
            };
            let client_id = req
                .client_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            peer.send_json(&connect_ok(hub.server_id(), &client_id, &rover_id))?;
            session.add_control_client(&client_id, Box::new(peer.clone()));
            info!("control: client {client_id} attached to rover {rover_id}");
            Ok(Some(Phase::Connected { session, client_id }))
        }
        _ => {
            failed(peer, Reason::UnknownCmd)?;
            Ok(None)
        }
    }
}

fn on_command(peer: &WsPeer, session: &RoverSession, text: &str) -> Result<()> {
    let outcome = match parse_command(text) {
        Ok(ClientCommand::Tracking(cmd)) => session.apply_tracking(&cmd),
        Ok(ClientCommand::Rover(cmd)) => match session.forward(&cmd) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("control: forward to {} failed: {e}", session.rover_id());
                Err(Reason::UnknownRover)
            }
        },
        Err(reason) => Err(reason),
    };
    match outcome {
        Ok(()) => reply(peer, Reply::Ok),
        Err(reason) => {
            debug!("control: {} rejected: {reason}", session.rover_id());
            failed(peer, reason)
        }
    }
}

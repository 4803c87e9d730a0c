use log::info;

use super::RoverHub;
use super::ws::WsPeer;
use crate::error::{ProxyError, Reason, Result};
use crate::protocol::{ClientRequest, Reply, connect_ok, stream_header};
use crate::registry::PeerSink;

/// Subscribe a viewer: connect, ack, 8-byte header, then hand the socket to
/// the rover's registry. The viewer is not read from again.
pub(super) fn handle_stream(mut peer: WsPeer, hub: &RoverHub, magic: [u8; 4]) -> Result<()> {
    let addr = peer.addr();
    let Some(text) = peer.recv_blocking()? else {
        return Ok(());
    };

    let refuse = |peer: &mut WsPeer, info: Reason, why: String| -> Result<()> {
        let _ = peer.send_json(&Reply::Failed { info }.to_json());
        peer.close();
        Err(ProxyError::Handshake(format!("{addr}: {why}")))
    };

    let req = match serde_json::from_str::<ClientRequest>(&text) {
        Ok(req) => req,
        Err(e) => return refuse(&mut peer, Reason::ParsingError, e.to_string()),
    };
    if req.cmd.as_deref() != Some("connect") {
        let why = format!("expected connect, got {:?}", req.cmd);
        return refuse(&mut peer, Reason::UnknownCmd, why);
    }
    let rover_id = req.rover_id.unwrap_or_default();
    let session = match hub.lookup(&rover_id) {
        Ok(s) => s,
        Err(e) => return refuse(&mut peer, Reason::UnknownRover, e.to_string()),
    };

    let client_id = req
        .client_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let format = session.identity().format;
    peer.send_json(&connect_ok(hub.server_id(), &client_id, &rover_id))?;
    // sizes fit u16: checked when the rover registered
    let header = stream_header(magic, format.width as u16, format.height as u16);
    peer.send_binary(&header)?;

    session.add_stream_client(&client_id, Box::new(peer));
    info!("stream: viewer {client_id} ({addr}) watching rover {rover_id}");
    Ok(())
}

//! Delivery of protocol envelopes over a node's transport hub, including
//! the relaying of client-bound replies through the node a client entered
//! through.

use std::collections::HashMap;

use crate::node::{NodeDirectory, NodeId, Source, TransportHub};
use crate::packets::{Envelope, ReconMsg, Requester};
use crate::utils::ReconError;

impl TransportHub<ReconMsg> {
    /// Stamps a message received from a client with where it entered, so
    /// that whichever node answers can route the reply back through me.
    pub fn stamp_inbound(&self, src: Source, msg: ReconMsg) -> ReconMsg {
        match src {
            Source::Client(client) => msg.with_requester(Requester {
                entry: self.me().clone(),
                client,
            }),
            Source::Peer(_) => msg,
        }
    }

    /// Hands a client-bound reply to its client if the client entered
    /// through me. Returns false if the reply is not mine to relay.
    pub fn relay_client_reply(&self, msg: &ReconMsg) -> Result<bool, ReconError> {
        let Some(requester) = msg.requester() else {
            return Ok(false);
        };
        if requester.entry != *self.me() {
            return Ok(false);
        }
        self.send_client(msg.clone(), requester.client)?;
        Ok(true)
    }

    /// Sends every envelope. Client-bound replies addressed to myself go to
    /// the client directly; everything else goes to the addressed node,
    /// looping back if that is me. Failures are logged per envelope.
    pub fn deliver(&mut self, envelopes: Vec<Envelope>) {
        for Envelope { to, msg } in envelopes {
            if to == *self.me() && msg.is_client_reply() {
                if let Err(e) = self.relay_client_reply(&msg) {
                    pf_warn!("error relaying {} to client: {}", msg.packet_type(), e);
                }
                continue;
            }
            pf_debug!("send {} of '{}' -> {}", msg.packet_type(), msg.name(), to);
            if let Err(e) = self.send_msg(msg, &to) {
                pf_error!("error sending -> {}: {}", to, e);
            }
        }
    }

    /// Delivers envelopes produced by a step that moved membership to
    /// `dir`. Joining peers get their addresses before delivery and leaving
    /// peers lose theirs after it, so both can be told about the change.
    pub fn deliver_across(&mut self, envelopes: Vec<Envelope>, dir: &NodeDirectory) {
        let next = peer_addrs_of(dir, self.me());
        let mut union = self.peer_addrs().clone();
        union.extend(next.iter().map(|(id, addr)| (id.clone(), *addr)));
        self.set_peer_addrs(union);
        self.deliver(envelopes);
        self.set_peer_addrs(next);
    }
}

/// Addresses of every node but `me`, as the transport hub wants them.
pub fn peer_addrs_of(
    dir: &NodeDirectory,
    me: &NodeId,
) -> HashMap<NodeId, std::net::SocketAddr> {
    dir.all_addrs()
        .into_iter()
        .filter(|(id, _)| id != me)
        .collect()
}

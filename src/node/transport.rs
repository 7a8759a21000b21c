//! Node TCP transport hub. A single listening port per node accepts both
//! peer nodes and clients; the first frame on every connection is a `Hello`
//! identifying the connecting side. Peer links are one-directional: a node
//! sends over connections it dials and receives over connections it accepts.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::node::{ClientId, NodeId};
use crate::utils::{
    safe_tcp_read, tcp_bind_with_retry, tcp_connect_with_retry, tcp_write_obj,
    ReconError,
};

use bytes::BytesMut;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Handshake frame sent first on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hello {
    /// A peer node that will send protocol messages.
    Peer(NodeId),

    /// A client that will send requests and expects replies on the same
    /// connection.
    Client(ClientId),
}

/// Origin of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Peer(NodeId),
    Client(ClientId),
}

/// Node TCP transport module.
pub struct TransportHub<Msg> {
    /// My node ID.
    me: NodeId,

    /// Map from peer ID -> its listening address.
    peer_addrs: HashMap<NodeId, SocketAddr>,

    /// Map from peer ID -> sender side of its send channel.
    tx_sends: HashMap<NodeId, mpsc::UnboundedSender<Msg>>,

    /// Sender side of the recv channel, used for loopback and cloned into
    /// listener threads.
    tx_recv: mpsc::UnboundedSender<(Source, Msg)>,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<(Source, Msg)>,

    /// Map from client ID -> sender side of its reply channel, shared with
    /// the acceptor thread.
    tx_replies: flashmap::ReadHandle<ClientId, mpsc::UnboundedSender<Msg>>,

    /// Join handle of the acceptor thread.
    _acceptor_handle: JoinHandle<()>,

    /// Map from peer ID -> peer sender thread join handles.
    sender_handles: HashMap<NodeId, JoinHandle<()>>,
}

// TransportHub public API implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a new transport hub listening on `bind_addr`. Spawns the
    /// acceptor thread. Connections to peers are made lazily on first send.
    pub async fn new_and_setup(
        me: NodeId,
        bind_addr: SocketAddr,
        peer_addrs: HashMap<NodeId, SocketAddr>,
    ) -> Result<Self, ReconError> {
        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<ClientId, mpsc::UnboundedSender<Msg>>();

        let acceptor_handle = tokio::spawn(Self::acceptor_thread(
            me.clone(),
            listener,
            tx_recv.clone(),
            tx_replies_write,
        ));

        Ok(TransportHub {
            me,
            peer_addrs,
            tx_sends: HashMap::new(),
            tx_recv,
            rx_recv,
            tx_replies: tx_replies_read,
            _acceptor_handle: acceptor_handle,
            sender_handles: HashMap::new(),
        })
    }

    /// My node ID.
    pub fn me(&self) -> &NodeId {
        &self.me
    }

    /// Current peer address book.
    pub fn peer_addrs(&self) -> &HashMap<NodeId, SocketAddr> {
        &self.peer_addrs
    }

    /// Replaces the peer address book after a membership change. Links to
    /// removed or moved peers are closed once their queued messages are
    /// written.
    pub fn set_peer_addrs(&mut self, peer_addrs: HashMap<NodeId, SocketAddr>) {
        let unchanged = |id: &NodeId| {
            peer_addrs.get(id).is_some_and(|a| self.peer_addrs.get(id) == Some(a))
        };
        let stale: Vec<NodeId> = self
            .tx_sends
            .keys()
            .filter(|id| !unchanged(id))
            .cloned()
            .collect();
        for id in stale {
            // dropping the sender lets the sender thread drain and exit
            self.tx_sends.remove(&id);
            self.sender_handles.remove(&id);
            pf_debug!("closing link to {}", id);
        }
        self.peer_addrs = peer_addrs;
    }

    /// Sends a message to a peer node. Messages addressed to myself are
    /// looped back into my own recv channel.
    pub fn send_msg(&mut self, msg: Msg, peer: &NodeId) -> Result<(), ReconError> {
        if *peer == self.me {
            self.tx_recv.send((Source::Peer(self.me.clone()), msg))?;
            return Ok(());
        }

        // re-spawn the sender thread if its connection has died
        if self.tx_sends.get(peer).map_or(true, |tx| tx.is_closed()) {
            let Some(addr) = self.peer_addrs.get(peer).copied() else {
                return logged_err!("peer {} has no known address", peer);
            };
            let (tx_send, rx_send) = mpsc::unbounded_channel();
            let handle = tokio::spawn(Self::peer_sender_thread(
                self.me.clone(),
                peer.clone(),
                addr,
                rx_send,
            ));
            self.tx_sends.insert(peer.clone(), tx_send);
            self.sender_handles.insert(peer.clone(), handle);
        }

        match self.tx_sends.get(peer) {
            Some(tx_send) => Ok(tx_send.send(msg)?),
            None => logged_err!("peer {} sender missing", peer),
        }
    }

    /// Sends a reply back to a client connected to me.
    pub fn send_client(
        &self,
        msg: Msg,
        client: ClientId,
    ) -> Result<(), ReconError> {
        let tx_replies_guard = self.tx_replies.guard();
        match tx_replies_guard.get(&client) {
            Some(tx_reply) => Ok(tx_reply.send(msg)?),
            None => logged_err!("client {} not connected to me", client),
        }
    }

    /// Receives the next inbound message from any source.
    pub async fn recv_msg(&mut self) -> Result<(Source, Msg), ReconError> {
        match self.rx_recv.recv().await {
            Some(pair) => Ok(pair),
            None => logged_err!("recv channel has been closed"),
        }
    }
}

// TransportHub connection threads implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Acceptor thread function.
    async fn acceptor_thread(
        me: NodeId,
        listener: TcpListener,
        tx_recv: mpsc::UnboundedSender<(Source, Msg)>,
        mut tx_replies: flashmap::WriteHandle<
            ClientId,
            mpsc::UnboundedSender<Msg>,
        >,
    ) {
        pf_debug!("acceptor thread spawned");

        loop {
            let (mut stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    pf_warn!("error accepting connection: {}", e);
                    continue;
                }
            };

            let mut read_buf = BytesMut::with_capacity(8 + 1024);
            let hello = time::timeout(
                Duration::from_secs(5),
                safe_tcp_read::<Hello, _>(&mut read_buf, &mut stream),
            )
            .await;
            match hello {
                Ok(Ok(Hello::Peer(id))) => {
                    pf_debug!("accepted peer {} from {}", id, addr);
                    tokio::spawn(Self::peer_listener_thread(
                        id,
                        stream,
                        read_buf,
                        tx_recv.clone(),
                    ));
                }

                Ok(Ok(Hello::Client(id))) => {
                    let mut tx_replies_guard = tx_replies.guard();
                    if let Some(sender) = tx_replies_guard.get(&id) {
                        if sender.is_closed() {
                            // this client ID has left before, collect it now
                            tx_replies_guard.remove(id);
                        } else {
                            pf_error!("duplicate client ID: {}", id);
                            continue;
                        }
                    }
                    let (tx_reply, rx_reply) = mpsc::unbounded_channel();
                    tx_replies_guard.insert(id, tx_reply);
                    tx_replies_guard.publish();
                    pf_info!("accepted new client {}", id);

                    tokio::spawn(Self::client_servant_thread(
                        id,
                        stream,
                        read_buf,
                        tx_recv.clone(),
                        rx_reply,
                    ));
                }

                Ok(Err(e)) => {
                    pf_warn!("bad hello from {}: {}", addr, e);
                }
                Err(_) => {
                    pf_warn!("hello from {} timed out", addr);
                }
            }

            if tx_recv.is_closed() {
                break;
            }
        }

        pf_debug!("acceptor thread for {} exited", me);
    }

    /// Peer sender thread function. Dials the peer, then forwards everything
    /// from the send channel until an error occurs.
    async fn peer_sender_thread(
        me: NodeId,
        id: NodeId,
        addr: SocketAddr,
        mut rx_send: mpsc::UnboundedReceiver<Msg>,
    ) {
        let mut conn = match tcp_connect_with_retry(addr, 10).await {
            Ok(conn) => conn,
            Err(e) => {
                pf_error!("error connecting to {} ({}): {}", id, addr, e);
                return;
            }
        };
        if let Err(e) = tcp_write_obj(&Hello::Peer(me), &mut conn).await {
            pf_error!("error greeting {}: {}", id, e);
            return;
        }
        pf_debug!("connected to peer {} ({})", id, addr);

        while let Some(msg) = rx_send.recv().await {
            if let Err(e) = tcp_write_obj(&msg, &mut conn).await {
                pf_error!("error sending to {}: {}", id, e);
                break;
            }
            pf_trace!("sent to {} msg {:?}", id, msg);
        }

        pf_debug!("peer sender thread for {} exited", id);
    }

    /// Peer listener thread function.
    async fn peer_listener_thread(
        id: NodeId,
        mut conn: TcpStream,
        mut read_buf: BytesMut,
        tx_recv: mpsc::UnboundedSender<(Source, Msg)>,
    ) {
        loop {
            match safe_tcp_read::<Msg, _>(&mut read_buf, &mut conn).await {
                Ok(msg) => {
                    pf_trace!("recv from {} msg {:?}", id, msg);
                    if tx_recv.send((Source::Peer(id.clone()), msg)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    pf_debug!("peer {} link closed: {}", id, e);
                    break;
                }
            }
        }
    }

    /// Client request listener and reply sender thread function.
    async fn client_servant_thread(
        id: ClientId,
        mut conn: TcpStream,
        mut read_buf: BytesMut,
        tx_recv: mpsc::UnboundedSender<(Source, Msg)>,
        mut rx_reply: mpsc::UnboundedReceiver<Msg>,
    ) {
        let (mut conn_read, mut conn_write) = conn.split();

        loop {
            tokio::select! {
                // prioritize sending back replies
                biased;

                reply = rx_reply.recv() => {
                    match reply {
                        Some(reply) => {
                            if let Err(e) = tcp_write_obj(&reply, &mut conn_write).await {
                                pf_error!("error replying to {}: {}", id, e);
                            }
                        },
                        None => break,
                    }
                },

                req = safe_tcp_read::<Msg, _>(&mut read_buf, &mut conn_read) => {
                    match req {
                        Ok(req) => {
                            pf_trace!("request from {} req {:?}", id, req);
                            if tx_recv.send((Source::Client(id), req)).is_err() {
                                break;
                            }
                        },
                        Err(e) => {
                            pf_info!("client {} has left: {}", id, e);
                            break;
                        }
                    }
                },
            }
        }
    }
}

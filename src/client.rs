//! Client-side stub: one TCP connection to a node, over which the client
//! issues name-service and application requests and waits for replies.

use std::net::SocketAddr;

use crate::node::{ClientId, Hello, NodeConfigChange};
use crate::packets::{AppOp, AppReply, AppRequest, Epoch, ReconMsg, RequestId};
use crate::utils::{
    safe_tcp_read, tcp_connect_with_retry, tcp_write_obj, ReconError, Timer,
};

use bytes::BytesMut;

use tokio::net::TcpStream;
use tokio::time::Duration;

/// Connection of a client to one node.
pub struct ReconClient {
    /// My client ID.
    id: ClientId,

    /// Address of the node I am connected to.
    addr: SocketAddr,

    /// TCP connection to the node.
    conn: TcpStream,

    /// Buffer of partially read replies.
    read_buf: BytesMut,

    /// Next application request ID.
    next_req: RequestId,

    /// Reply timeout timer.
    timer: Timer,

    /// Reply timeout.
    timeout: Duration,
}

impl ReconClient {
    /// Connects to the node at `addr` and introduces myself as client `id`.
    pub async fn connect(
        id: ClientId,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Self, ReconError> {
        if timeout.is_zero() {
            return logged_err!("invalid reply timeout {:?}", timeout);
        }
        let mut conn = tcp_connect_with_retry(addr, 10).await?;
        tcp_write_obj(&Hello::Client(id), &mut conn).await?;
        pf_debug!("connected to {}", addr);

        Ok(ReconClient {
            id,
            addr,
            conn,
            read_buf: BytesMut::with_capacity(8 + 1024),
            next_req: 0,
            timer: Timer::new(),
            timeout,
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Address of the node I am connected to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Sends a message to the node.
    pub async fn send(&mut self, msg: &ReconMsg) -> Result<(), ReconError> {
        pf_trace!("send {:?}", msg);
        tcp_write_obj(msg, &mut self.conn).await
    }

    /// Waits for the next reply, failing if none arrives within the timeout.
    pub async fn recv(&mut self) -> Result<ReconMsg, ReconError> {
        self.timer.restart(self.timeout)?;
        tokio::select! {
            msg = safe_tcp_read::<ReconMsg, _>(&mut self.read_buf, &mut self.conn) => {
                let msg = msg?;
                pf_trace!("recv {:?}", msg);
                Ok(msg)
            },
            _ = self.timer.timeout() => {
                logged_err!("no reply from {} within {:?}", self.addr, self.timeout)
            }
        }
    }

    /// Sends a message and waits for its reply.
    async fn call(&mut self, msg: ReconMsg) -> Result<ReconMsg, ReconError> {
        self.send(&msg).await?;
        self.recv().await
    }

    /// Creates a name; replies with a `ClientReply`.
    pub async fn create(
        &mut self,
        name: &str,
        initial_state: &str,
    ) -> Result<ReconMsg, ReconError> {
        self.call(ReconMsg::CreateServiceName {
            name: name.into(),
            initial_state: initial_state.into(),
            requester: None,
        })
        .await
    }

    /// Deletes a name; replies with a `ClientReply`.
    pub async fn delete(&mut self, name: &str) -> Result<ReconMsg, ReconError> {
        self.call(ReconMsg::DeleteServiceName {
            name: name.into(),
            requester: None,
        })
        .await
    }

    /// Asks a reconfigurator to change the node pools; replies with a
    /// `ClientReply`.
    pub async fn reconfigure_nodes(
        &mut self,
        change: NodeConfigChange,
    ) -> Result<ReconMsg, ReconError> {
        self.call(ReconMsg::ReconfigureNodeConfig {
            change,
            requester: None,
        })
        .await
    }

    /// Looks up the current active replicas of a name; replies with
    /// `ActiveReplicas`, or a failed `ClientReply` if the name is unknown.
    pub async fn lookup(&mut self, name: &str) -> Result<ReconMsg, ReconError> {
        self.call(ReconMsg::RequestActiveReplicas {
            name: name.into(),
            requester: None,
        })
        .await
    }

    /// Issues an application request against a name. Updates go through the
    /// group's coordinator; reads are served from the local copy.
    pub async fn request(
        &mut self,
        name: &str,
        epoch: Option<Epoch>,
        op: AppOp,
    ) -> Result<AppReply, ReconError> {
        let id = self.next_req;
        self.next_req += 1;
        let req = AppRequest {
            id,
            name: name.into(),
            epoch,
            needs_coordination: op.is_update(),
            op,
            requester: None,
        };
        match self.call(ReconMsg::AppRequest(req)).await? {
            ReconMsg::AppReply(reply) if reply.id == id => Ok(reply),
            other => logged_err!("unexpected reply {:?}", other),
        }
    }

    /// Reads `key` of a name.
    pub async fn get(&mut self, name: &str, key: &str) -> Result<AppReply, ReconError> {
        self.request(name, None, AppOp::Get { key: key.into() })
            .await
    }

    /// Writes `key` of a name.
    pub async fn put(
        &mut self,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<AppReply, ReconError> {
        self.request(
            name,
            None,
            AppOp::Put {
                key: key.into(),
                value: value.into(),
            },
        )
        .await
    }
}

#[cfg(test)]
mod client_tests {
    use super::*;
    use crate::node::{NodeId, Source, TransportHub};
    use crate::packets::{PacketType, Requester};
    use std::collections::HashMap;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn create_round_trip() -> Result<(), ReconError> {
        let me: NodeId = "RC0".parse()?;
        let addr: SocketAddr = "127.0.0.1:54830".parse()?;
        let mut hub: TransportHub<ReconMsg> =
            TransportHub::new_and_setup(me.clone(), addr, HashMap::new()).await?;
        let client = tokio::spawn(async move {
            let mut client =
                ReconClient::connect(9, addr, Duration::from_secs(5)).await?;
            client.create("alice", "hello").await
        });

        let (src, msg) = hub.recv_msg().await?;
        assert_eq!(src, Source::Client(9));
        let msg = hub.stamp_inbound(src, msg);
        assert_eq!(
            msg.requester(),
            Some(&Requester {
                entry: me,
                client: 9
            })
        );
        let reply = ReconMsg::ClientReply {
            name: "alice".into(),
            kind: PacketType::CreateServiceName,
            success: true,
            detail: "created".into(),
            requester: msg.requester().cloned(),
        };
        assert!(hub.relay_client_reply(&reply)?);

        let got = client.await.map_err(ReconError::msg)??;
        assert_eq!(got, reply);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reply_timeout() -> Result<(), ReconError> {
        let addr: SocketAddr = "127.0.0.1:54831".parse()?;
        let _hub: TransportHub<ReconMsg> =
            TransportHub::new_and_setup("AR0".parse()?, addr, HashMap::new())
                .await?;
        let mut client =
            ReconClient::connect(3, addr, Duration::from_millis(200)).await?;
        assert!(client.get("alice", "k").await.is_err());
        Ok(())
    }
}

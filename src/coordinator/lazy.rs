//! Lazy-broadcast coordinator: apply locally, then push the request to every
//! other group member without waiting for acknowledgment.

use crate::app::Application;
use crate::coordinator::{Completion, CoordinatorKind, GroupCore, ReplicaCoordinator};
use crate::node::NodeId;
use crate::packets::{AppRequest, Envelope, ReconMsg};
use crate::utils::ReconError;

/// Best-effort broadcast coordinator; eventual consistency only.
pub struct LazyBroadcastCoordinator {
    core: GroupCore,
}

impl LazyBroadcastCoordinator {
    pub fn new(me: NodeId, app: Box<dyn Application>) -> Self {
        LazyBroadcastCoordinator {
            core: GroupCore::new(me, app),
        }
    }
}

impl ReplicaCoordinator for LazyBroadcastCoordinator {
    fn kind(&self) -> CoordinatorKind {
        CoordinatorKind::LazyBroadcast
    }

    fn core(&self) -> &GroupCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut GroupCore {
        &mut self.core
    }

    fn coordinate_request(
        &mut self,
        req: AppRequest,
        mut completion: Completion,
    ) -> Result<bool, ReconError> {
        let members = self
            .core
            .group(&req.name)
            .map(|g| g.members.clone())
            .unwrap_or_default();
        let reply = self.core.execute(&req);
        if !reply.success {
            return Ok(false);
        }

        let mut relayed = req;
        relayed.requester = None;
        let me = self.core.me().clone();
        for member in members.into_iter().filter(|m| m != &me) {
            self.core
                .push_outbound(Envelope::new(member, ReconMsg::Replicate(relayed.clone())));
        }
        completion.fulfill(reply)?;
        Ok(true)
    }
}

#[cfg(test)]
mod lazy_tests {
    use super::*;
    use crate::app::KvApplication;
    use crate::coordinator::coordinator_tests::{nid, put};

    #[test]
    fn broadcasts_to_others() -> Result<(), ReconError> {
        let group = [nid("AR0"), nid("AR1"), nid("AR2")];
        let mut coord =
            LazyBroadcastCoordinator::new(nid("AR0"), Box::new(KvApplication::new()));
        coord.create_replica_group("alice", 0, "", &group)?;
        let (completion, mut rx) = Completion::new();
        assert!(coord.handle_incoming(put(1, "alice", true), completion)?);
        assert!(rx.try_recv()?.success);
        let out = coord.take_outbound();
        let targets: Vec<NodeId> = out.iter().map(|e| e.to.clone()).collect();
        assert_eq!(targets, vec![nid("AR1"), nid("AR2")]);
        assert!(coord.take_outbound().is_empty());

        // a peer applies the relayed request without re-broadcasting
        let mut peer =
            LazyBroadcastCoordinator::new(nid("AR1"), Box::new(KvApplication::new()));
        peer.create_replica_group("alice", 0, "", &group)?;
        match &out[0].msg {
            ReconMsg::Replicate(req) => assert!(peer.apply_replicated(req.clone())),
            other => panic!("unexpected {:?}", other),
        }
        assert!(peer.take_outbound().is_empty());
        Ok(())
    }

    #[test]
    fn uncoordinated_stays_local() -> Result<(), ReconError> {
        let mut coord =
            LazyBroadcastCoordinator::new(nid("AR0"), Box::new(KvApplication::new()));
        coord.create_replica_group("alice", 0, "", &[nid("AR0"), nid("AR1")])?;
        assert!(coord.handle_incoming(put(1, "alice", false), Completion::detached())?);
        assert!(coord.take_outbound().is_empty());
        Ok(())
    }
}

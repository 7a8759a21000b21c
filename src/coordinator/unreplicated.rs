//! Unreplicated coordinator: single-copy semantics, no coordination at all.

use crate::app::Application;
use crate::coordinator::{Completion, CoordinatorKind, GroupCore, ReplicaCoordinator};
use crate::node::NodeId;
use crate::packets::AppRequest;
use crate::utils::ReconError;

pub struct UnreplicatedCoordinator {
    core: GroupCore,
}

impl UnreplicatedCoordinator {
    pub fn new(me: NodeId, app: Box<dyn Application>) -> Self {
        UnreplicatedCoordinator {
            core: GroupCore::new(me, app),
        }
    }
}

impl ReplicaCoordinator for UnreplicatedCoordinator {
    fn kind(&self) -> CoordinatorKind {
        CoordinatorKind::Unreplicated
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
        let reply = self.core.execute(&req);
        if !reply.success {
            return Ok(false);
        }
        completion.fulfill(reply)?;
        Ok(true)
    }
}

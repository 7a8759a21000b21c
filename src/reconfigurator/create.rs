//! Reconfigurator -- name creation and lookup.

use super::*;

use std::collections::BTreeSet;

use crate::records::RecordState;
use crate::reconfigurator::tasks::WaitAckStartEpoch;

impl Reconfigurator {
    /// Handler of a `CreateServiceName` request.
    pub(super) fn handle_create(
        &mut self,
        name: String,
        initial_state: String,
        requester: Option<Requester>,
    ) -> Result<Vec<Envelope>, ReconError> {
        if let Some(forwarded) = self.forward_to_primary(
            || ReconMsg::CreateServiceName {
                name: name.clone(),
                initial_state: initial_state.clone(),
                requester: requester.clone(),
            },
            &name,
        ) {
            return forwarded;
        }

        let fail = |detail: &str,
                    requester: Option<Requester>|
         -> Result<Vec<Envelope>, ReconError> {
            Ok(RcContext::client_reply(
                &name,
                PacketType::CreateServiceName,
                false,
                detail,
                requester,
            )
            .into_iter()
            .collect())
        };

        if self.ctx.store.get_record(&name)?.is_some() {
            pf_debug!("create of existing name '{}'", name);
            return fail("name exists", requester);
        }
        let actives = self.ctx.rings.current().actives.replicated_servers(&name);
        if actives.is_empty() {
            pf_warn!("no active replicas to host '{}'", name);
            return fail("no active replicas", requester);
        }

        let group: BTreeSet<NodeId> = actives.iter().cloned().collect();
        if !self.ctx.store.create_record(&name, group, &initial_state)? {
            return fail("name exists", requester);
        }
        Ok(self.executor.spawn(
            WaitAckStartEpoch::new(
                name,
                0,
                actives,
                Vec::new(),
                0,
                Some(initial_state),
                requester,
            ),
            &mut self.ctx,
        ))
    }

    /// Handler of a `RequestActiveReplicas` lookup.
    pub(super) fn handle_lookup(
        &mut self,
        name: String,
        requester: Option<Requester>,
    ) -> Result<Vec<Envelope>, ReconError> {
        if let Some(forwarded) = self.forward_to_primary(
            || ReconMsg::RequestActiveReplicas {
                name: name.clone(),
                requester: requester.clone(),
            },
            &name,
        ) {
            return forwarded;
        }

        let reply = match self.ctx.store.get_record(&name)? {
            Some(rec)
                if rec.state != RecordState::Deleted
                    && !rec.active_replicas.is_empty() =>
            {
                Envelope::to_requester(ReconMsg::ActiveReplicas {
                    name,
                    epoch: rec.epoch,
                    actives: rec.active_replicas.into_iter().collect(),
                    requester,
                })
            }
            _ => RcContext::client_reply(
                &name,
                PacketType::RequestActiveReplicas,
                false,
                "name not found",
                requester,
            ),
        };
        Ok(reply.into_iter().collect())
    }
}

#[cfg(test)]
mod create_tests {
    use super::*;
    use crate::reconfigurator::reconfigurator_tests::{
        nid, primary_and_other, reconfigurator,
    };

    fn client() -> Option<Requester> {
        Some(Requester {
            entry: nid("RC0"),
            client: 42,
        })
    }

    #[test]
    fn create_spawns_start() -> Result<(), ReconError> {
        let (primary, _) = primary_and_other("alice");
        let mut rc = reconfigurator(&primary, &ReconfiguratorConfig::default());
        let sends = rc.handle_msg(ReconMsg::CreateServiceName {
            name: "alice".into(),
            initial_state: "hello".into(),
            requester: client(),
        })?;
        assert_eq!(sends.len(), 3);
        for env in &sends {
            match &env.msg {
                ReconMsg::StartEpoch {
                    epoch,
                    prev_group,
                    initial_state,
                    ..
                } => {
                    assert_eq!(*epoch, 0);
                    assert!(prev_group.is_empty());
                    assert_eq!(initial_state.as_deref(), Some("hello"));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(rc.outstanding_tasks(), vec!["WaitAckStartEpoch/alice:0"]);
        assert!(rc.store().get_record("alice")?.is_some_and(|r| r.is_creating()));

        // creating again fails fast
        let sends = rc.handle_msg(ReconMsg::CreateServiceName {
            name: "alice".into(),
            initial_state: "again".into(),
            requester: client(),
        })?;
        assert!(matches!(
            &sends[..],
            [Envelope { msg: ReconMsg::ClientReply { success: false, .. }, .. }]
        ));
        Ok(())
    }

    #[test]
    fn non_primary_forwards() -> Result<(), ReconError> {
        let (primary, other) = primary_and_other("alice");
        let mut rc = reconfigurator(&other, &ReconfiguratorConfig::default());
        let sends = rc.handle_msg(ReconMsg::RequestActiveReplicas {
            name: "alice".into(),
            requester: client(),
        })?;
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].to, nid(&primary));
        assert_eq!(sends[0].msg.requester(), client().as_ref());
        assert!(rc.outstanding_tasks().is_empty());
        Ok(())
    }

    #[test]
    fn lookup_after_creation() -> Result<(), ReconError> {
        let (primary, _) = primary_and_other("alice");
        let mut rc = reconfigurator(&primary, &ReconfiguratorConfig::default());
        let lookup = ReconMsg::RequestActiveReplicas {
            name: "alice".into(),
            requester: client(),
        };
        let sends = rc.handle_msg(lookup.clone())?;
        assert!(matches!(
            &sends[0].msg,
            ReconMsg::ClientReply { success: false, .. }
        ));

        let starts = rc.handle_msg(ReconMsg::CreateServiceName {
            name: "alice".into(),
            initial_state: "".into(),
            requester: None,
        })?;
        // not served while still being created
        let sends = rc.handle_msg(lookup.clone())?;
        assert!(matches!(
            &sends[0].msg,
            ReconMsg::ClientReply { success: false, .. }
        ));

        for env in &starts {
            rc.handle_msg(ReconMsg::AckStartEpoch {
                name: "alice".into(),
                epoch: 0,
                responder: env.to.clone(),
            })?;
        }
        let sends = rc.handle_msg(lookup)?;
        match &sends[0].msg {
            ReconMsg::ActiveReplicas { epoch, actives, .. } => {
                assert_eq!(*epoch, 0);
                assert_eq!(actives.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        // all acked, nothing left to collect for a creation
        assert!(rc.outstanding_tasks().is_empty());
        Ok(())
    }
}

//! Application collaborator interface and the built-in key-value application.

use std::collections::{BTreeMap, HashMap};

use crate::packets::{AppOp, AppReply, AppRequest, Epoch, RequestId};
use crate::utils::ReconError;

/// Application whose per-name state the replica groups serve.
pub trait Application: Send {
    /// Applies a request to the local copy of its name's state.
    fn handle_request(&mut self, req: &AppRequest) -> AppReply;

    /// Checkpoints the state of `name`; `None` if the name is not hosted.
    fn get_state(&self, name: &str) -> Option<String>;

    /// Replaces the state of `name` with a checkpoint.
    fn update_state(&mut self, name: &str, state: &str) -> Result<(), ReconError>;

    /// Drops the state of `name`.
    fn delete_state(&mut self, name: &str);

    /// Builds the request that stops `name` at `epoch`.
    fn stop_request(&self, name: &str, epoch: Epoch, id: RequestId) -> AppRequest {
        AppRequest {
            id,
            name: name.into(),
            epoch: Some(epoch),
            op: AppOp::Stop,
            needs_coordination: true,
            requester: None,
        }
    }
}

/// State of one name: a flat string map, checkpointed as TOML text.
type Record = BTreeMap<String, String>;

/// In-memory key-value application.
#[derive(Debug, Default)]
pub struct KvApplication {
    /// Map from name -> its record.
    records: HashMap<String, Record>,
}

impl KvApplication {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Application for KvApplication {
    fn handle_request(&mut self, req: &AppRequest) -> AppReply {
        let mut reply = AppReply {
            id: req.id,
            name: req.name.clone(),
            success: true,
            value: None,
            requester: req.requester.clone(),
        };
        match &req.op {
            AppOp::Get { key } => {
                reply.value = self
                    .records
                    .get(&req.name)
                    .and_then(|r| r.get(key).cloned());
            }
            AppOp::Put { key, value } => {
                reply.value = self
                    .records
                    .entry(req.name.clone())
                    .or_default()
                    .insert(key.clone(), value.clone());
            }
            AppOp::Stop => {}
        }
        reply
    }

    fn get_state(&self, name: &str) -> Option<String> {
        let record = self.records.get(name)?;
        match toml::to_string(record) {
            Ok(state) => Some(state),
            Err(e) => {
                pf_error!("error checkpointing '{}': {}", name, e);
                None
            }
        }
    }

    fn update_state(&mut self, name: &str, state: &str) -> Result<(), ReconError> {
        let trimmed = state.trim();
        let record: Record = if trimmed.is_empty() || trimmed == "{}" {
            Record::new()
        } else {
            toml::from_str(trimmed)?
        };
        self.records.insert(name.into(), record);
        Ok(())
    }

    fn delete_state(&mut self, name: &str) {
        self.records.remove(name);
    }
}

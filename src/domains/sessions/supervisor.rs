use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::timeout;

use crate::domains::environments::{
    EnvironmentHandle, EnvironmentStatus, ExecutionEnvironment, SessionContext,
};
use crate::errors::{CoreError, CoreResult};

#[derive(Clone)]
pub struct Supervised {
    pub environment: Arc<dyn ExecutionEnvironment>,
    pub handle: EnvironmentHandle,
}

enum Slot {
    /// `start` is in flight; the slot is held so a second start is rejected.
    Starting,
    Active(Supervised),
}

/// Owns the single live agent handle of each running session.
///
/// The map lock is only held to read or swap a slot, never across a call
/// into an environment.
pub struct ProcessSupervisor {
    slots: Mutex<HashMap<String, Slot>>,
    status_timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(status_timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            status_timeout,
        }
    }

    fn slots(&self) -> CoreResult<MutexGuard<'_, HashMap<String, Slot>>> {
        self.slots.lock().map_err(|_| CoreError::Internal {
            message: "supervisor lock poisoned".to_string(),
        })
    }

    /// Starts the agent and records its handle. Fails with `Conflict` when
    /// the session already has one.
    pub async fn start_session(
        &self,
        session_id: &str,
        environment: Arc<dyn ExecutionEnvironment>,
        context: &SessionContext,
    ) -> CoreResult<EnvironmentHandle> {
        {
            let mut slots = self.slots()?;
            if slots.contains_key(session_id) {
                return Err(CoreError::conflict(
                    format!("Session '{}' already has a running agent", context.session_name),
                    Vec::new(),
                ));
            }
            slots.insert(session_id.to_string(), Slot::Starting);
        }

        debug!(
            "Starting agent for session '{}' in {}",
            context.session_name,
            environment.name()
        );
        match environment.start(context).await {
            Ok(handle) => {
                self.slots()?.insert(
                    session_id.to_string(),
                    Slot::Active(Supervised {
                        environment,
                        handle: handle.clone(),
                    }),
                );
                info!("Session '{}' supervised as {handle}", context.session_name);
                Ok(handle)
            }
            Err(e) => {
                self.slots()?.remove(session_id);
                warn!("Agent start failed for session '{}': {e}", context.session_name);
                Err(e.into())
            }
        }
    }

    /// Registers a handle recorded by an earlier process.
    pub fn adopt(
        &self,
        session_id: &str,
        environment: Arc<dyn ExecutionEnvironment>,
        handle: EnvironmentHandle,
    ) -> CoreResult<()> {
        let mut slots = self.slots()?;
        if slots.contains_key(session_id) {
            return Err(CoreError::conflict(
                format!("Session '{session_id}' is already supervised"),
                Vec::new(),
            ));
        }
        slots.insert(
            session_id.to_string(),
            Slot::Active(Supervised {
                environment,
                handle,
            }),
        );
        Ok(())
    }

    /// Stops the supervised agent. Returns `false` when nothing was
    /// supervised, which callers treat as already stopped.
    pub async fn stop(&self, session_id: &str) -> CoreResult<bool> {
        let supervised = {
            let mut slots = self.slots()?;
            match slots.remove(session_id) {
                None => return Ok(false),
                Some(Slot::Starting) => {
                    slots.insert(session_id.to_string(), Slot::Starting);
                    return Err(CoreError::conflict(
                        format!("Session '{session_id}' is still starting"),
                        Vec::new(),
                    ));
                }
                Some(Slot::Active(supervised)) => supervised,
            }
        };

        if let Err(e) = supervised.environment.stop(&supervised.handle).await {
            warn!("Stopping {} failed: {e}", supervised.handle);
            self.slots()?
                .entry(session_id.to_string())
                .or_insert(Slot::Active(supervised));
            return Err(e.into());
        }
        info!("Stopped {} for session {session_id}", supervised.handle);
        Ok(true)
    }

    /// Polls the environment, bounded by the status timeout. Unsupervised
    /// sessions are reported as stopped.
    pub async fn get_status(&self, session_id: &str) -> CoreResult<EnvironmentStatus> {
        let supervised = match self.supervised(session_id)? {
            Some(supervised) => supervised,
            None => {
                let starting = matches!(self.slots()?.get(session_id), Some(Slot::Starting));
                return Ok(if starting {
                    EnvironmentStatus::Unknown
                } else {
                    EnvironmentStatus::Stopped
                });
            }
        };
        Ok(self
            .poll(&supervised.environment, &supervised.handle)
            .await)
    }

    pub async fn poll(
        &self,
        environment: &Arc<dyn ExecutionEnvironment>,
        handle: &EnvironmentHandle,
    ) -> EnvironmentStatus {
        match timeout(self.status_timeout, environment.status(handle)).await {
            Ok(status) => status,
            Err(_) => {
                warn!("Status of {handle} did not answer within {:?}", self.status_timeout);
                EnvironmentStatus::Unknown
            }
        }
    }

    pub fn supervised(&self, session_id: &str) -> CoreResult<Option<Supervised>> {
        Ok(match self.slots()?.get(session_id) {
            Some(Slot::Active(supervised)) => Some(supervised.clone()),
            _ => None,
        })
    }

    /// Environment and handle of a running session, for side commands.
    pub fn sandbox(&self, session_id: &str) -> CoreResult<Supervised> {
        self.supervised(session_id)?.ok_or_else(|| {
            CoreError::validation(
                "session",
                format!("Session '{session_id}' has no running sandbox"),
            )
        })
    }

    pub fn is_supervised(&self, session_id: &str) -> bool {
        self.slots()
            .map(|slots| slots.contains_key(session_id))
            .unwrap_or(false)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.slots()
            .map(|slots| slots.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Best-effort stop of everything supervised. Returns the ids stopped.
    pub async fn shutdown_all(&self) -> Vec<String> {
        let drained: Vec<(String, Supervised)> = match self.slots() {
            Ok(mut slots) => {
                let ids: Vec<String> = slots
                    .iter()
                    .filter(|(_, slot)| matches!(slot, Slot::Active(_)))
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.into_iter()
                    .filter_map(|id| match slots.remove(&id) {
                        Some(Slot::Active(supervised)) => Some((id, supervised)),
                        _ => None,
                    })
                    .collect()
            }
            Err(e) => {
                warn!("Cannot shut down supervised sessions: {e}");
                return Vec::new();
            }
        };

        let stops = drained.into_iter().map(|(id, supervised)| async move {
            match supervised.environment.stop(&supervised.handle).await {
                Ok(()) => Some(id),
                Err(e) => {
                    warn!("Shutdown of {} failed: {e}", supervised.handle);
                    None
                }
            }
        });
        futures::future::join_all(stops)
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}

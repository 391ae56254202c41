//! The update lifecycle state machine.
//!
//! One state is active at a time. The runner feeds it the controller and
//! replaces it with whatever `handle` returns, until the terminal `done`
//! state is reached. Transitions are expressed entirely by the returned next
//! state; the `cancelled` flag is informational.
//!
//! Wait states suspend on a `tokio::select!` between the poll timer and the
//! cancel channel. A supervisor holds the [`ControlHandle`]: `cancel` wakes
//! a waiting state early (looping back to the same state, so a forced poll
//! does not disturb the state graph), `stop` closes the channel and the next
//! wait shuts the machine down. The channel has capacity one, so a cancel
//! sent while no wait is active is held for the next wait and further
//! cancels are dropped.

use std::fmt;
use std::mem;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::agent::{Controller, ImageStream};
use crate::client::{DeploymentStatus, UpdateResponse};
use crate::error::AgentError;

/// Stable state tag, also the wire encoding used when a state is logged or
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateId {
    Init,
    Bootstrapped,
    AuthorizeWait,
    Authorized,
    UpdateCheckWait,
    UpdateCheck,
    UpdateFetch,
    UpdateInstall,
    Reboot,
    UpdateCommit,
    UpdateError,
    Error,
    Done,
}

impl StateId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateId::Init => "init",
            StateId::Bootstrapped => "bootstrapped",
            StateId::AuthorizeWait => "authorize-wait",
            StateId::Authorized => "authorized",
            StateId::UpdateCheckWait => "update-check-wait",
            StateId::UpdateCheck => "update-check",
            StateId::UpdateFetch => "update-fetch",
            StateId::UpdateInstall => "update-install",
            StateId::Reboot => "reboot",
            StateId::UpdateCommit => "update-commit",
            StateId::UpdateError => "update-error",
            StateId::Error => "error",
            StateId::Done => "done",
        }
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state plus its payload. Stateless states are unit variants created on
/// demand; payload-bearing states are single-use and consumed by `handle`.
pub enum State {
    Init,
    Bootstrapped,
    AuthorizeWait,
    Authorized,
    UpdateCheckWait,
    UpdateCheck,
    UpdateFetch {
        update: UpdateResponse,
    },
    UpdateInstall {
        image: ImageStream,
        size: u64,
        update: UpdateResponse,
    },
    Reboot {
        update: UpdateResponse,
    },
    UpdateCommit {
        update: UpdateResponse,
    },
    UpdateError {
        cause: AgentError,
        update: UpdateResponse,
    },
    Error {
        cause: AgentError,
    },
    Done,
}

impl State {
    pub fn id(&self) -> StateId {
        match self {
            State::Init => StateId::Init,
            State::Bootstrapped => StateId::Bootstrapped,
            State::AuthorizeWait => StateId::AuthorizeWait,
            State::Authorized => StateId::Authorized,
            State::UpdateCheckWait => StateId::UpdateCheckWait,
            State::UpdateCheck => StateId::UpdateCheck,
            State::UpdateFetch { .. } => StateId::UpdateFetch,
            State::UpdateInstall { .. } => StateId::UpdateInstall,
            State::Reboot { .. } => StateId::Reboot,
            State::UpdateCommit { .. } => StateId::UpdateCommit,
            State::UpdateError { .. } => StateId::UpdateError,
            State::Error { .. } => StateId::Error,
            State::Done => StateId::Done,
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "State({})", self.id())
    }
}

/// Supervisor-side handle for waking or stopping the machine.
pub struct ControlHandle {
    tx: Option<mpsc::Sender<()>>,
}

impl ControlHandle {
    /// Wake the current (or next) wait early. Returns whether the signal was
    /// accepted; a second cancel while one is already pending is dropped.
    pub fn cancel(&self) -> bool {
        match &self.tx {
            Some(tx) => tx.try_send(()).is_ok(),
            None => false,
        }
    }

    /// Permanently shut the machine down: the next wait (or the current one)
    /// observes the closed channel and transitions to `done`.
    pub fn stop(&mut self) {
        self.tx = None;
    }
}

pub struct StateMachine {
    current: State,
    cancel_rx: mpsc::Receiver<()>,
    fail_deployment_on_report_error: bool,
    last_inventory: Option<Instant>,
}

impl StateMachine {
    pub fn new(fail_deployment_on_report_error: bool) -> (Self, ControlHandle) {
        let (tx, cancel_rx) = mpsc::channel(1);
        (
            Self {
                current: State::Init,
                cancel_rx,
                fail_deployment_on_report_error,
                last_inventory: None,
            },
            ControlHandle { tx: Some(tx) },
        )
    }

    pub fn state(&self) -> &State {
        &self.current
    }

    pub fn set_state(&mut self, state: State) {
        self.current = state;
    }

    pub fn current_id(&self) -> StateId {
        self.current.id()
    }

    /// Drive the machine to completion.
    pub async fn run(&mut self, c: &mut dyn Controller) {
        info!("update agent state machine starting");
        while self.current.id() != StateId::Done {
            self.step(c).await;
        }
        info!("update agent state machine finished");
    }

    /// Handle the current state once and install its successor. Returns
    /// whether the state reported being cancelled.
    pub async fn step(&mut self, c: &mut dyn Controller) -> bool {
        let state = mem::replace(&mut self.current, State::Done);
        let from = state.id();
        let (next, cancelled) = self.handle(state, c).await;
        debug!(%from, to = %next.id(), cancelled, "state transition");
        self.current = next;
        cancelled
    }

    async fn handle(&mut self, state: State, c: &mut dyn Controller) -> (State, bool) {
        match state {
            State::Init => {
                debug!("handling init state");
                match c.bootstrap().await {
                    Ok(()) => (State::Bootstrapped, false),
                    Err(cause) => {
                        error!("bootstrap failed: {cause}");
                        (State::Error { cause }, false)
                    }
                }
            }

            State::Bootstrapped => {
                debug!("handling bootstrapped state");
                match c.authorize().await {
                    Ok(()) => (State::Authorized, false),
                    Err(cause) if cause.is_fatal() => {
                        error!("authorization failed: {cause}");
                        (State::Error { cause }, false)
                    }
                    Err(cause) => {
                        warn!("authorization failed: {cause}");
                        (State::AuthorizeWait, false)
                    }
                }
            }

            State::AuthorizeWait => {
                debug!("handling authorize wait state");
                let interval = c.update_poll_interval();
                debug!(?interval, "waiting before next authorization attempt");
                self.wait(State::Bootstrapped, State::AuthorizeWait, interval)
                    .await
            }

            State::Authorized => {
                debug!("handling authorized state");
                match c.has_upgrade().await {
                    Err(cause) => {
                        error!("upgrade probe failed: {cause}");
                        (State::Error { cause }, false)
                    }
                    Ok(true) => {
                        // Booted into a tentative image: confirm it. The
                        // persisted record restores the deployment identity
                        // lost across the reboot.
                        let update = match c.stored_deployment().await {
                            Some(update) => update,
                            None => {
                                warn!("tentative image active but no deployment record found");
                                UpdateResponse::default()
                            }
                        };
                        (State::UpdateCommit { update }, false)
                    }
                    Ok(false) => (State::UpdateCheckWait, false),
                }
            }

            State::UpdateCheckWait => {
                debug!("handling update check wait state");
                let interval = c.update_poll_interval();
                debug!(?interval, "waiting before next deployment poll");
                self.wait(State::UpdateCheck, State::UpdateCheckWait, interval)
                    .await
            }

            State::UpdateCheck => {
                debug!("handling update check state");
                if self.inventory_due(c.inventory_poll_interval()) {
                    // Inventory rides on the poll loop; a failed submission
                    // never holds up update checks.
                    match c.inventory_refresh().await {
                        Ok(()) => self.last_inventory = Some(Instant::now()),
                        Err(e) => warn!("inventory refresh failed: {e}"),
                    }
                }
                match c.check_update().await {
                    Ok(Some(update)) => (State::UpdateFetch { update }, false),
                    Ok(None) => (State::UpdateCheckWait, false),
                    Err(cause) => {
                        error!("update check failed: {cause}");
                        (State::Error { cause }, false)
                    }
                }
            }

            State::UpdateFetch { update } => {
                debug!("handling update fetch state");
                if let Some(cause) = self
                    .report(c, &update, DeploymentStatus::Downloading)
                    .await
                {
                    return (State::UpdateError { cause, update }, false);
                }
                match c.fetch_update(&update.artifact.source.uri).await {
                    Ok((image, size)) => (
                        State::UpdateInstall {
                            image,
                            size,
                            update,
                        },
                        false,
                    ),
                    Err(cause) => {
                        error!("update fetch failed: {cause}");
                        (State::UpdateError { cause, update }, false)
                    }
                }
            }

            State::UpdateInstall {
                image,
                size,
                update,
            } => {
                debug!("handling update install state");
                if let Some(cause) = self.report(c, &update, DeploymentStatus::Installing).await {
                    return (State::UpdateError { cause, update }, false);
                }
                if let Err(cause) = c.install_update(image, size).await {
                    error!("update install failed: {cause}");
                    return (State::UpdateError { cause, update }, false);
                }
                if let Err(cause) = c.enable_updated_partition().await {
                    error!("enabling updated partition failed: {cause}");
                    return (State::UpdateError { cause, update }, false);
                }
                // Losing the record only costs the deployment id in the
                // post-reboot report, not the update itself, so the reboot is
                // not blocked on it.
                if let Err(e) = c.store_deployment(&update).await {
                    warn!("failed to persist deployment record before reboot: {e}");
                }
                (State::Reboot { update }, false)
            }

            State::Reboot { update } => {
                debug!("handling reboot state");
                if let Err(e) = c
                    .report_update_status(&update, DeploymentStatus::Rebooting)
                    .await
                {
                    warn!("failed to report rebooting status: {e}");
                }
                match c.reboot().await {
                    // On a real device the process dies before this returns.
                    Ok(()) => (State::Done, false),
                    Err(e) => (
                        State::Error {
                            cause: AgentError::fatal(e.into_cause()),
                        },
                        false,
                    ),
                }
            }

            State::UpdateCommit { update } => {
                debug!("handling update commit state");
                if let Err(e) = c.commit_update().await {
                    error!("update commit failed: {e}");
                    return (
                        State::Error {
                            cause: AgentError::fatal(e.into_cause()),
                        },
                        false,
                    );
                }
                match c
                    .report_update_status(&update, DeploymentStatus::Success)
                    .await
                {
                    Ok(()) => {}
                    Err(cause) if cause.is_fatal() => {
                        error!("failed to report success status: {cause}");
                        return (State::Error { cause }, false);
                    }
                    Err(cause) if self.fail_deployment_on_report_error => {
                        error!("failed to report success status: {cause}");
                        return (State::UpdateError { cause, update }, false);
                    }
                    Err(e) => warn!("failed to report success status: {e}"),
                }
                (State::UpdateCheckWait, false)
            }

            State::UpdateError { cause, update } => {
                debug!("handling update error state");
                info!(deployment = %update.id, "deployment failed: {cause}");
                if let Err(e) = c
                    .report_update_status(&update, DeploymentStatus::Failure)
                    .await
                {
                    warn!("failed to report failure status: {e}");
                }
                let logs = serde_json::json!({
                    "messages": [{
                        "time": Utc::now().to_rfc3339(),
                        "level": "error",
                        "msg": cause.to_string(),
                    }]
                });
                if let Err(e) = c.upload_log(&update, &logs).await {
                    warn!("failed to upload deployment log: {e}");
                }
                (State::Init, false)
            }

            State::Error { cause } => {
                info!("handling error state: {cause}");
                if cause.is_fatal() {
                    (State::Done, false)
                } else {
                    (State::Init, false)
                }
            }

            State::Done => {
                debug_assert!(false, "done state re-entered");
                (State::Done, false)
            }
        }
    }

    /// Suspend until `duration` elapses (→ `next`) or a cancel arrives
    /// (→ `same`, cancelled). A closed cancel channel shuts the machine down.
    async fn wait(&mut self, next: State, same: State, duration: Duration) -> (State, bool) {
        tokio::select! {
            _ = time::sleep(duration) => {
                debug!("wait complete");
                (next, false)
            }
            signal = self.cancel_rx.recv() => match signal {
                Some(()) => {
                    info!("wait cancelled");
                    (same, true)
                }
                None => {
                    info!("shutdown requested during wait");
                    (State::Done, true)
                }
            }
        }
    }

    /// Report deployment status, deciding whether a failure abandons the
    /// deployment: fatal report errors (server-side abort) always do,
    /// transient ones only when configured.
    async fn report(
        &self,
        c: &mut dyn Controller,
        update: &UpdateResponse,
        status: DeploymentStatus,
    ) -> Option<AgentError> {
        match c.report_update_status(update, status).await {
            Ok(()) => None,
            Err(e) if e.is_fatal() || self.fail_deployment_on_report_error => {
                error!(%status, "status report failed: {e}");
                Some(e)
            }
            Err(e) => {
                warn!(%status, "status report failed: {e}");
                None
            }
        }
    }

    fn inventory_due(&self, interval: Duration) -> bool {
        match self.last_inventory {
            None => true,
            Some(at) => at.elapsed() >= interval,
        }
    }
}

//! Capture session state machine
//!
//! A session moves `AwaitInit -> Identified -> Closed`. Declarations that arrive
//! before the handshake are held back and only attributed to the function once its
//! init request has been accepted; a protocol violation discards them, so a failed
//! session never mutates the function's dependencies.

use super::dependencies::{FunctionDependencies, WorkerRole};
use super::error::DiscoveryError;
use super::resources::{Declaration, ResourceKey};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitInit,
    Identified,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::AwaitInit => "await_init",
            SessionState::Identified => "identified",
            SessionState::Closed => "closed",
        })
    }
}

/// Result delivered to whoever waits on a session
pub type SessionOutcome = Result<FunctionDependencies, DiscoveryError>;

#[derive(Debug)]
pub struct CaptureSession {
    id: String,
    function: String,
    state: SessionState,
    pending: Vec<Declaration>,
    deps: FunctionDependencies,
}

impl CaptureSession {
    pub fn new(id: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            function: function.into(),
            state: SessionState::AwaitInit,
            pending: Vec::new(),
            deps: FunctionDependencies::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn dependencies(&self) -> &FunctionDependencies {
        &self.deps
    }

    /// Accepts the worker's init request
    ///
    /// Held declarations are applied together with the worker's binding, after
    /// which the session is `Identified`.
    pub fn identify(&mut self, role: WorkerRole) -> Result<(), DiscoveryError> {
        match self.state {
            SessionState::AwaitInit => {}
            SessionState::Identified => {
                return Err(DiscoveryError::protocol(format!(
                    "session for '{}' is already identified",
                    self.function
                )))
            }
            SessionState::Closed => return Err(DiscoveryError::SessionClosed(self.id.clone())),
        }

        let mut deps = FunctionDependencies::new();
        for declaration in self.pending.drain(..) {
            deps.declare(declaration);
        }
        deps.add_worker(role);

        self.deps = deps;
        self.state = SessionState::Identified;
        Ok(())
    }

    /// Records a declaration, holding it back until the session is identified
    pub fn declare(&mut self, declaration: Declaration) -> Result<(), DiscoveryError> {
        match self.state {
            SessionState::AwaitInit => {
                if !self.pending.contains(&declaration) {
                    self.pending.push(declaration);
                }
                Ok(())
            }
            SessionState::Identified => {
                self.deps.declare(declaration);
                Ok(())
            }
            SessionState::Closed => Err(DiscoveryError::SessionClosed(self.id.clone())),
        }
    }

    /// Looks up a resource this session declared, applied or still held back
    pub fn describe(&self, key: &ResourceKey) -> Result<&Declaration, DiscoveryError> {
        self.deps
            .get(key)
            .or_else(|| self.pending.iter().rev().find(|d| &d.key() == key))
            .ok_or_else(|| DiscoveryError::ResourceNotFound(key.to_string()))
    }

    /// Closes the session after a contract violation
    ///
    /// Nothing the worker sent is kept.
    pub fn violate(&mut self, reason: impl Into<String>) -> DiscoveryError {
        self.pending.clear();
        self.deps = FunctionDependencies::new();
        self.state = SessionState::Closed;
        DiscoveryError::protocol(reason)
    }

    /// Closes the session with an externally imposed failure (timeout, cancellation)
    pub fn abort(&mut self, error: DiscoveryError) -> DiscoveryError {
        self.pending.clear();
        self.deps = FunctionDependencies::new();
        self.state = SessionState::Closed;
        error
    }

    /// Closes the session normally once the handshake has completed
    pub fn close(&mut self) -> SessionOutcome {
        match self.state {
            SessionState::Identified => {
                self.state = SessionState::Closed;
                Ok(self.deps.clone())
            }
            SessionState::AwaitInit => {
                Err(self.violate("stream closed before an init request was received"))
            }
            SessionState::Closed => Err(DiscoveryError::SessionClosed(self.id.clone())),
        }
    }
}

//! Exclusive, timeout-bounded connection to one instrument.

use super::{Transport, TransportFactory, TransportParams};
use crate::error::{AppResult, DaqError};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// One open connection plus its response timeout.
///
/// Queries take `&mut self`, so only the current owner can talk to the
/// instrument. The sampling loop takes the whole session by value while an
/// acquisition runs and hands it back when it stops.
pub struct TransportSession {
    resource: String,
    timeout: Duration,
    transport: Box<dyn Transport>,
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("resource", &self.resource)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TransportSession {
    /// Open `resource` through `factory`.
    ///
    /// # Errors
    /// [`DaqError::Connection`] if the resource cannot be opened.
    pub async fn open(
        factory: &dyn TransportFactory,
        resource: &str,
        params: &TransportParams,
    ) -> AppResult<Self> {
        let transport = factory.open(resource, params).await.map_err(|e| match e {
            DaqError::Connection { .. } => e,
            other => DaqError::Connection {
                resource: resource.to_string(),
                reason: other.to_string(),
            },
        })?;
        debug!(resource, timeout = ?params.timeout, "Transport session opened");
        Ok(Self::from_transport(resource, params.timeout, transport))
    }

    /// Wrap an already open transport.
    pub fn from_transport(
        resource: impl Into<String>,
        timeout: Duration,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            resource: resource.into(),
            timeout,
            transport,
        }
    }

    /// Resource the session was opened on.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Response timeout applied to each query.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `command` and wait up to the configured timeout for the reply.
    ///
    /// # Errors
    /// - [`DaqError::Timeout`] when nothing arrives in time (recoverable)
    /// - [`DaqError::Transport`] for any other fault
    pub async fn query(&mut self, command: &str) -> AppResult<String> {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.transport.query(command, self.timeout)).await;
        match outcome {
            Ok(Ok(response)) => {
                trace!(
                    resource = %self.resource,
                    command,
                    response = %response,
                    elapsed = ?started.elapsed(),
                    "Query answered"
                );
                Ok(response)
            }
            Ok(Err(err @ DaqError::Timeout { .. })) => {
                debug!(resource = %self.resource, command, "Instrument did not respond");
                Err(err)
            }
            Ok(Err(DaqError::Transport(reason))) => Err(DaqError::Transport(reason)),
            Ok(Err(other)) => Err(DaqError::Transport(other.to_string())),
            Err(_) => {
                debug!(resource = %self.resource, command, timeout = ?self.timeout, "Query timed out");
                Err(DaqError::Timeout {
                    command: command.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Release the connection. Consumes the session so it can only happen once.
    pub async fn close(mut self) -> AppResult<()> {
        match self.transport.close().await {
            Ok(()) => {
                debug!(resource = %self.resource, "Transport session closed");
                Ok(())
            }
            Err(e) => {
                warn!(resource = %self.resource, error = %e, "Error while closing transport");
                Err(e)
            }
        }
    }
}

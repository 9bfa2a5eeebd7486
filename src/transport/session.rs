use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::config::{ConnectionConfig, ReconnectPolicy};
use crate::error::{ConnectionError, TransportError};
use crate::transport::{CommandOutput, Connection, Connector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
    Closed,
}

struct Inner<T> {
    conn: Option<T>,
    closed: bool,
    ever_connected: bool,
    reconnects: u32,
    last_activity: Option<DateTime<Utc>>,
}

/// A long-lived remote session with at most one live connection.
///
/// Every command holds the session lock for its whole duration, so commands
/// on one session never overlap. Reconnect and close take the same lock and
/// therefore never race an in-flight command.
pub struct Session<C: Connector> {
    connector: Arc<C>,
    config: Arc<ConnectionConfig>,
    policy: ReconnectPolicy,
    inner: Mutex<Inner<C::Connection>>,
}

impl<C: Connector> Session<C> {
    /// Create a session that connects lazily on its first command.
    pub fn new(connector: Arc<C>, config: Arc<ConnectionConfig>, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            config,
            policy,
            inner: Mutex::new(Inner {
                conn: None,
                closed: false,
                ever_connected: false,
                reconnects: 0,
                last_activity: None,
            }),
        }
    }

    /// Create a session and establish its connection right away.
    ///
    /// Fails fast: a single attempt bounded by the connect timeout.
    pub async fn connect(
        connector: Arc<C>,
        config: Arc<ConnectionConfig>,
        policy: ReconnectPolicy,
    ) -> Result<Self, ConnectionError> {
        let session = Self::new(connector, config, policy);
        {
            let mut inner = session.inner.lock().await;
            let conn = session.connector.connect(&session.config).await?;
            inner.conn = Some(conn);
            inner.ever_connected = true;
            inner.last_activity = Some(Utc::now());
        }
        tracing::info!(host = session.config.host(), "Session established");
        Ok(session)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Make sure a live connection exists, reconnecting if needed.
    pub async fn ensure_connected(&self) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock().await;
        self.ensure_connected_locked(&mut inner).await
    }

    /// Run one remote command.
    pub async fn execute(&self, command: &str) -> Result<CommandOutput, TransportError> {
        self.execute_with_input(command, None).await
    }

    /// Run one remote command with `input` on its stdin.
    ///
    /// A command is never replayed after the channel dies under it: the
    /// connection is dropped, the error surfaces, and the next command
    /// reconnects first.
    pub async fn execute_with_input(
        &self,
        command: &str,
        input: Option<&[u8]>,
    ) -> Result<CommandOutput, TransportError> {
        let mut inner = self.inner.lock().await;
        self.ensure_connected_locked(&mut inner).await?;

        let conn = match inner.conn.as_mut() {
            Some(conn) => conn,
            None => return Err(ConnectionError::Closed.into()),
        };

        tracing::debug!(host = self.config.host(), command, "Executing remote command");
        match conn.exec(command, input).await {
            Ok(output) => {
                inner.last_activity = Some(Utc::now());
                tracing::trace!(
                    exit_code = output.exit_code,
                    stdout_len = output.stdout.len(),
                    stderr_len = output.stderr.len(),
                    "Remote command finished"
                );
                Ok(output)
            }
            Err(e) => {
                tracing::warn!(
                    host = self.config.host(),
                    error = %e,
                    "Remote channel failed, marking session disconnected"
                );
                if let Some(mut dead) = inner.conn.take() {
                    dead.close().await;
                }
                Err(e)
            }
        }
    }

    /// Release the connection. Further commands fail with `ConnectionError::Closed`.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut conn) = inner.conn.take() {
            conn.close().await;
        }
        if !inner.closed {
            inner.closed = true;
            tracing::info!(host = self.config.host(), "Session closed");
        }
    }

    pub async fn state(&self) -> SessionState {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return SessionState::Closed;
        }
        match inner.conn.as_mut().map(|conn| conn.is_alive()) {
            Some(true) => SessionState::Connected,
            _ => SessionState::Disconnected,
        }
    }

    pub async fn reconnect_count(&self) -> u32 {
        self.inner.lock().await.reconnects
    }

    pub async fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().await.last_activity
    }

    async fn ensure_connected_locked(
        &self,
        inner: &mut Inner<C::Connection>,
    ) -> Result<(), ConnectionError> {
        if inner.closed {
            return Err(ConnectionError::Closed);
        }
        if let Some(conn) = inner.conn.as_mut() {
            if conn.is_alive() {
                return Ok(());
            }
            tracing::warn!(host = self.config.host(), "Connection dropped");
            if let Some(mut dead) = inner.conn.take() {
                dead.close().await;
            }
        }

        let conn = self.reconnect(inner.ever_connected).await?;
        if inner.ever_connected {
            inner.reconnects += 1;
        }
        inner.conn = Some(conn);
        inner.ever_connected = true;
        inner.last_activity = Some(Utc::now());
        Ok(())
    }

    /// One immediate attempt, then up to `max_attempts` more with
    /// exponential backoff.
    async fn reconnect(&self, was_connected: bool) -> Result<C::Connection, ConnectionError> {
        let host = self.config.host();
        let mut last = match self.connector.connect(&self.config).await {
            Ok(conn) => {
                if was_connected {
                    tracing::info!(host, "Reconnected");
                }
                return Ok(conn);
            }
            Err(e) => e,
        };

        for attempt in 1..=self.policy.max_attempts {
            if !last.is_transient() {
                return Err(last);
            }
            let delay = self.policy.delay_for(attempt);
            tracing::warn!(
                host,
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %last,
                "Connection attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
            match self.connector.connect(&self.config).await {
                Ok(conn) => {
                    tracing::info!(host, attempt, "Reconnected");
                    return Ok(conn);
                }
                Err(e) => last = e,
            }
        }

        if !last.is_transient() {
            return Err(last);
        }
        tracing::error!(host, attempts = self.policy.max_attempts, error = %last, "Giving up on connection");
        Err(ConnectionError::Exhausted {
            host: host.to_string(),
            attempts: self.policy.max_attempts,
            last: Box::new(last),
        })
    }
}

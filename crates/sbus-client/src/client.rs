//! Client for one session-enabled queue or subscription.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sbus_core::{EntityPath, Error, Result, SessionConfig};

use crate::link::{AcceptSessionOptions, SessionAcceptor};
use crate::session::{
    ManagerError, SessionErrorHandler, SessionHandle, SessionHandlerOptions, SessionManager,
    SessionMessageHandler,
};

/// Receives from a session-enabled entity, either by letting a
/// [`SessionManager`] pump sessions or by accepting them one at a time.
pub struct SessionClient {
    entity: EntityPath,
    acceptor: Arc<dyn SessionAcceptor>,
    config: SessionConfig,
    manager: SessionManager,
    /// Parent of every unmanaged session's token.
    cancel: CancellationToken,
}

impl SessionClient {
    /// Create a client with default session settings.
    pub fn new(entity: EntityPath, acceptor: Arc<dyn SessionAcceptor>) -> Self {
        let manager = SessionManager::new(entity.path(), Arc::clone(&acceptor));
        Self {
            entity,
            acceptor,
            config: SessionConfig::default(),
            manager,
            cancel: CancellationToken::new(),
        }
    }

    /// Create a client whose manager limits and default handler options
    /// come from `config`.
    pub fn with_config(
        entity: EntityPath,
        acceptor: Arc<dyn SessionAcceptor>,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let client = Self {
            config,
            ..Self::new(entity, acceptor)
        };
        client
            .manager
            .set_max_concurrent_sessions(client.config.max_concurrent_sessions)
            .map_err(manager_error)?;
        if let Some(n) = client.config.max_concurrent_accept_requests {
            client
                .manager
                .set_max_concurrent_accept_requests(n)
                .map_err(manager_error)?;
        }
        Ok(client)
    }

    pub const fn entity(&self) -> &EntityPath {
        &self.entity
    }

    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub const fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Handler options derived from this client's config. Leaves the
    /// manager's limits as they are.
    pub fn default_options(&self) -> SessionHandlerOptions {
        SessionHandlerOptions {
            max_concurrent_sessions: None,
            max_concurrent_accept_requests: None,
            ..SessionHandlerOptions::from(&self.config)
        }
    }

    /// Lock one session without a manager: the session with `session_id`,
    /// or the next available one. The caller drives and closes it.
    pub async fn accept_session(&self, session_id: Option<&str>) -> Result<SessionHandle> {
        if self.cancel.is_cancelled() {
            return Err(Error::InvalidArgument(format!(
                "client for '{}' is closed",
                self.entity
            )));
        }
        let options = AcceptSessionOptions {
            receive_mode: self.config.receive_mode,
            session_id: session_id.map(str::to_string),
        };
        let link = self.acceptor.accept_next_session(&options).await?;
        let handle = SessionHandle::new(link, options.receive_mode, self.cancel.child_token());
        info!(entity = %self.entity, session_id = %handle.session_id(), "Accepted session");
        Ok(handle)
    }

    /// Start pumping sessions into `handler`. Returns once the manager's
    /// workers are running.
    pub fn receive_messages_from_sessions(
        &self,
        handler: Arc<dyn SessionMessageHandler>,
        on_error: Arc<dyn SessionErrorHandler>,
        options: SessionHandlerOptions,
    ) -> std::result::Result<(), ManagerError> {
        self.manager.manage(handler, on_error, options)
    }

    /// Stop the manager, close every session it is pumping and wait for
    /// the pumps to finish. Further `accept_session` calls fail.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.manager.close();
        for handle in self.manager.registry().handles().await {
            if let Err(e) = handle.close().await {
                warn!(
                    entity = %self.entity,
                    session_id = %handle.session_id(),
                    error = %e,
                    "Failed to close session"
                );
            }
        }
        self.manager.wait_until_drained().await;
        info!(entity = %self.entity, "Session client closed");
    }
}

fn manager_error(err: ManagerError) -> Error {
    Error::Config(err.to_string())
}

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Sink, SinkExt};
use pgwire::api::auth::{
    finish_authentication, protocol_negotiation, save_startup_parameters_to_metadata,
    ServerParameterProvider, StartupHandler,
};
use pgwire::api::{ClientInfo, PgWireConnectionState};
use pgwire::error::{PgWireError, PgWireResult};
use pgwire::messages::startup::Authentication;
use pgwire::messages::{PgWireBackendMessage, PgWireFrontendMessage};
use tracing::{debug, warn};

use crate::engine::{Engine, EngineError};
use crate::model::Identity;

/// Resolves the caller of a request from the login name on the connection.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_identity(&self, login: Option<&str>) -> Result<Identity, EngineError>;
}

/// Login name is the user's e-mail. Unknown and inactive users are
/// unauthenticated.
#[async_trait]
impl IdentityProvider for Engine {
    async fn current_identity(&self, login: Option<&str>) -> Result<Identity, EngineError> {
        let login = login.ok_or(EngineError::Unauthenticated)?;
        match self.user_by_email(login).await {
            Some(user) if user.is_active => Ok(user.identity()),
            _ => Err(EngineError::Unauthenticated),
        }
    }
}

/// Cleartext password startup. The client sends the password in the clear
/// (wrap the socket in TLS) and it is checked against the stored argon2 hash.
pub struct RoomdStartupHandler<P> {
    engine: Arc<Engine>,
    parameter_provider: P,
}

impl<P: ServerParameterProvider> RoomdStartupHandler<P> {
    pub fn new(engine: Arc<Engine>, parameter_provider: P) -> Self {
        Self {
            engine,
            parameter_provider,
        }
    }
}

#[async_trait]
impl<P: ServerParameterProvider> StartupHandler for RoomdStartupHandler<P> {
    async fn on_startup<C>(
        &self,
        client: &mut C,
        message: PgWireFrontendMessage,
    ) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        match message {
            PgWireFrontendMessage::Startup(ref startup) => {
                protocol_negotiation(client, startup).await?;
                save_startup_parameters_to_metadata(client, startup);
                client.set_state(PgWireConnectionState::AuthenticationInProgress);
                client
                    .send(PgWireBackendMessage::Authentication(
                        Authentication::CleartextPassword,
                    ))
                    .await?;
            }
            PgWireFrontendMessage::PasswordMessageFamily(pwd) => {
                let pwd = pwd.into_password()?;
                let user_name = client.metadata().get("user").cloned().unwrap_or_default();
                match self.engine.authenticate(&user_name, &pwd.password).await {
                    Ok(identity) => {
                        debug!("user {} authenticated", identity.id);
                        finish_authentication(client, &self.parameter_provider).await?;
                    }
                    Err(_) => {
                        warn!("login refused for {user_name}");
                        metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                        return Err(PgWireError::InvalidPassword(user_name));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

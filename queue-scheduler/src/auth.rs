use anyhow::bail;
use queue_scheduler_core::protocol::{OpenRequest, AUTHORIZATION_PROPERTY};
use queue_scheduler_core::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    None,
    SharedSecret,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    pub secret: Option<String>,
}

impl AuthConfig {
    pub fn authenticator(&self) -> anyhow::Result<Arc<dyn Authenticator>> {
        match self.mode {
            AuthMode::None => Ok(Arc::new(AllowAll)),
            AuthMode::SharedSecret => match self.secret.as_deref() {
                Some(secret) if !secret.is_empty() => {
                    Ok(Arc::new(SharedSecretAuthenticator::new(secret)))
                }
                _ => bail!("auth mode shared_secret requires a non empty secret"),
            },
        }
    }
}

/// Decides whether a broker that sent its `Open` frame may register.
pub trait Authenticator: Send + Sync + fmt::Debug {
    fn authenticate(&self, open: &OpenRequest) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _open: &OpenRequest) -> Result<()> {
        Ok(())
    }
}

/// Requires the `authorization` connection property to carry the configured secret.
#[derive(Clone)]
pub struct SharedSecretAuthenticator {
    secret: String,
}

impl fmt::Debug for SharedSecretAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecretAuthenticator").finish_non_exhaustive()
    }
}

impl SharedSecretAuthenticator {
    pub fn new(secret: impl Into<String>) -> Self {
        SharedSecretAuthenticator {
            secret: secret.into(),
        }
    }
}

impl Authenticator for SharedSecretAuthenticator {
    fn authenticate(&self, open: &OpenRequest) -> Result<()> {
        match open.properties.get(AUTHORIZATION_PROPERTY) {
            Some(presented) if presented == &self.secret => Ok(()),
            Some(_) => Err(SchedulerError::Unauthenticated(format!(
                "invalid secret presented by {}",
                open.container_id
            ))),
            None => Err(SchedulerError::Unauthenticated(format!(
                "{} did not present the {} property",
                open.container_id, AUTHORIZATION_PROPERTY
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_checks_the_authorization_property() {
        let auth = SharedSecretAuthenticator::new("s3cret");

        let good = OpenRequest::new("broker-0").with_property(AUTHORIZATION_PROPERTY, "s3cret");
        assert!(auth.authenticate(&good).is_ok());

        let wrong = OpenRequest::new("broker-0").with_property(AUTHORIZATION_PROPERTY, "nope");
        assert!(matches!(
            auth.authenticate(&wrong),
            Err(SchedulerError::Unauthenticated(_))
        ));

        let missing = OpenRequest::new("broker-0");
        assert!(matches!(
            auth.authenticate(&missing),
            Err(SchedulerError::Unauthenticated(_))
        ));
    }

    #[test]
    fn shared_secret_mode_without_secret_is_a_config_error() {
        let config: AuthConfig = serde_yaml::from_str("mode: shared_secret").unwrap();
        assert!(config.authenticator().is_err());

        let config: AuthConfig = serde_yaml::from_str("mode: none").unwrap();
        assert!(config
            .authenticator()
            .unwrap()
            .authenticate(&OpenRequest::new("anyone"))
            .is_ok());
    }
}

use async_trait::async_trait;
use shared::domain::UserId;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

/// Source of the signed-in user and the bearer credential used for both REST
/// calls and the push channel handshake.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    fn identity(&self) -> Option<Identity>;
    async fn bearer_token(&self) -> Result<Option<String>>;
}

pub struct MissingCredentials;

#[async_trait]
impl CredentialProvider for MissingCredentials {
    fn identity(&self) -> Option<Identity> {
        None
    }

    async fn bearer_token(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct StaticCredentials {
    identity: Identity,
    token: String,
}

impl StaticCredentials {
    pub fn new(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            identity: Identity {
                user_id: UserId::new(user_id),
                display_name: display_name.into(),
            },
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    fn identity(&self) -> Option<Identity> {
        Some(self.identity.clone())
    }

    async fn bearer_token(&self) -> Result<Option<String>> {
        let token = self.token.trim();
        if token.is_empty() {
            return Ok(None);
        }
        Ok(Some(token.to_string()))
    }
}

//! Grant requests sent to the token endpoint
//!
//! Both grants share the client identification fields and differ only in the
//! credential being exchanged. Field names and order are fixed by the
//! provider's form-encoded wire contract.

use common::Secret;

/// Static client identification, loaded once at process start.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub redirect_uri: String,
}

impl ClientCredentials {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<Secret<String>>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
        }
    }

    /// Build the grant that trades a one-time authorization code.
    pub fn authorization_code_grant(&self, code: impl Into<String>) -> TokenExchangeRequest {
        TokenExchangeRequest::AuthorizationCodeGrant {
            code: code.into(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_uri: self.redirect_uri.clone(),
        }
    }

    /// Build the grant that trades a stored refresh token.
    pub fn refresh_token_grant(&self, refresh_token: Secret<String>) -> TokenExchangeRequest {
        TokenExchangeRequest::RefreshTokenGrant {
            refresh_token,
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_uri: self.redirect_uri.clone(),
        }
    }
}

/// A token endpoint request. Both variants resolve to the same response shape.
#[derive(Debug, Clone)]
pub enum TokenExchangeRequest {
    AuthorizationCodeGrant {
        code: String,
        client_id: String,
        client_secret: Secret<String>,
        redirect_uri: String,
    },
    RefreshTokenGrant {
        refresh_token: Secret<String>,
        client_id: String,
        client_secret: Secret<String>,
        redirect_uri: String,
    },
}

impl TokenExchangeRequest {
    /// The `grant_type` form value.
    pub fn grant_type(&self) -> &'static str {
        match self {
            TokenExchangeRequest::AuthorizationCodeGrant { .. } => "authorization_code",
            TokenExchangeRequest::RefreshTokenGrant { .. } => "refresh_token",
        }
    }

    /// Form fields in wire order: `grant_type`, `client_id`, `client_secret`,
    /// `redirect_uri`, then `code` or `refresh_token`.
    pub fn form_fields(&self) -> [(&'static str, &str); 5] {
        match self {
            TokenExchangeRequest::AuthorizationCodeGrant {
                code,
                client_id,
                client_secret,
                redirect_uri,
            } => [
                ("grant_type", self.grant_type()),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.expose().as_str()),
                ("redirect_uri", redirect_uri.as_str()),
                ("code", code.as_str()),
            ],
            TokenExchangeRequest::RefreshTokenGrant {
                refresh_token,
                client_id,
                client_secret,
                redirect_uri,
            } => [
                ("grant_type", self.grant_type()),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.expose().as_str()),
                ("redirect_uri", redirect_uri.as_str()),
                ("refresh_token", refresh_token.expose().as_str()),
            ],
        }
    }
}

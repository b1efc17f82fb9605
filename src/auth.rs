//! Handshake authentication.
//!
//! Access tokens are RS256 JWTs minted by the external identity service.
//! Validation is signature + issuer + audience + expiry; no symmetric
//! algorithms are accepted. Channel entitlements derive from the `roles`
//! claim at handshake time and are fixed for the life of the session.

use std::collections::HashSet;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::{AppError, AppResult};
use crate::models::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Trader,
    Operations,
    Compliance,
    Admin,
}

impl Role {
    pub fn parse(value: &str) -> Option<Role> {
        match value.to_ascii_uppercase().as_str() {
            "TRADER" => Some(Role::Trader),
            "OPERATIONS" => Some(Role::Operations),
            "COMPLIANCE" => Some(Role::Compliance),
            "ADMIN" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Claims carried by IMS access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Authenticated identity attached to a session at handshake.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub roles: Vec<Role>,
}

impl AuthContext {
    pub fn permitted_channels(&self) -> HashSet<Channel> {
        let mut channels = HashSet::new();
        // Every authenticated principal may watch alerts.
        channels.insert(Channel::Alerts);
        for role in &self.roles {
            match role {
                Role::Trader | Role::Operations => {
                    channels.insert(Channel::Positions);
                    channels.insert(Channel::Inventory);
                    channels.insert(Channel::Locates);
                }
                Role::Compliance => {
                    channels.insert(Channel::Positions);
                    channels.insert(Channel::Inventory);
                }
                Role::Admin => {
                    channels.insert(Channel::Admin);
                }
            }
        }
        channels
    }

    pub fn may_access(&self, channel: Channel) -> bool {
        self.permitted_channels().contains(&channel)
    }
}

/// Validates bearer tokens against the configured issuer and audience.
///
/// The decoding key is parsed once at startup; the validator is immutable
/// afterwards and shared through application state.
pub struct TokenValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    pub fn new(config: &AuthConfig) -> AppResult<Self> {
        let decoding_key = DecodingKey::from_rsa_pem(config.public_key_pem.as_bytes())
            .map_err(|e| AppError::Config(format!("JWT public key parse: {e}")))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&config.issuer_uri]);
        validation.set_audience(&[&config.audience]);
        validation.validate_exp = true;

        Ok(Self {
            decoding_key,
            validation,
        })
    }

    pub fn validate(&self, token: &str) -> AppResult<AuthContext> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AppError::Unauthorized(format!("token rejected: {e}")))?;

        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(AppError::Unauthorized("token has no subject".into()));
        }

        let roles: Vec<Role> = claims
            .roles
            .iter()
            .filter_map(|r| Role::parse(r))
            .collect();

        Ok(AuthContext {
            user_id: claims.sub,
            roles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const TEST_PRIVATE_PEM: &str = include_str!("../tests/keys/test_rsa_private.pem");
    const TEST_PUBLIC_PEM: &str = include_str!("../tests/keys/test_rsa_public.pem");

    const ISSUER: &str = "https://idp.example.com";
    const AUDIENCE: &str = "distribution-hub";

    fn validator() -> TokenValidator {
        TokenValidator::new(&AuthConfig {
            issuer_uri: ISSUER.into(),
            audience: AUDIENCE.into(),
            public_key_pem: TEST_PUBLIC_PEM.into(),
        })
        .unwrap()
    }

    fn token(issuer: &str, audience: &str, exp_offset_secs: i64, roles: &[&str]) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "user-42".into(),
            iss: issuer.into(),
            aud: audience.into(),
            exp: now + exp_offset_secs,
            iat: now,
            roles: roles.iter().map(|r| r.to_string()).collect(),
        };
        encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &EncodingKey::from_rsa_pem(TEST_PRIVATE_PEM.as_bytes()).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_context_with_roles() {
        let ctx = validator()
            .validate(&token(ISSUER, AUDIENCE, 3600, &["Trader", "Operations"]))
            .unwrap();
        assert_eq!(ctx.user_id, "user-42");
        assert_eq!(ctx.roles, vec![Role::Trader, Role::Operations]);
    }

    #[test]
    fn expired_token_is_rejected() {
        let result = validator().validate(&token(ISSUER, AUDIENCE, -3600, &["Trader"]));
        assert!(matches!(result, Err(AppError::Unauthorized(_))));
    }

    #[test]
    fn wrong_audience_is_rejected() {
        let result = validator().validate(&token(ISSUER, "another-app", 3600, &["Trader"]));
        assert!(matches!(result, Err(AppError::Unauthorized(_))));
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let result =
            validator().validate(&token("https://evil.example.com", AUDIENCE, 3600, &["Trader"]));
        assert!(matches!(result, Err(AppError::Unauthorized(_))));
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(validator().validate("not-a-jwt").is_err());
    }

    #[test]
    fn unknown_roles_are_ignored() {
        let ctx = validator()
            .validate(&token(ISSUER, AUDIENCE, 3600, &["Trader", "Intern"]))
            .unwrap();
        assert_eq!(ctx.roles, vec![Role::Trader]);
    }

    fn ctx(roles: &[Role]) -> AuthContext {
        AuthContext {
            user_id: "user-42".into(),
            roles: roles.to_vec(),
        }
    }

    #[test]
    fn trader_channel_entitlements() {
        let ctx = ctx(&[Role::Trader]);
        assert!(ctx.may_access(Channel::Positions));
        assert!(ctx.may_access(Channel::Inventory));
        assert!(ctx.may_access(Channel::Locates));
        assert!(ctx.may_access(Channel::Alerts));
        assert!(!ctx.may_access(Channel::Admin));
    }

    #[test]
    fn compliance_cannot_watch_locates() {
        let ctx = ctx(&[Role::Compliance]);
        assert!(ctx.may_access(Channel::Positions));
        assert!(!ctx.may_access(Channel::Locates));
    }

    #[test]
    fn admin_channel_requires_admin_role() {
        assert!(ctx(&[Role::Admin]).may_access(Channel::Admin));
        assert!(!ctx(&[Role::Trader, Role::Operations]).may_access(Channel::Admin));
    }

    #[test]
    fn any_authenticated_principal_gets_alerts() {
        assert!(ctx(&[]).may_access(Channel::Alerts));
    }
}

//! Bearer credential verification and user resolution.

use crate::models::User;
use crate::services::store::DataStore;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Access token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
}

/// HS256 token verifier.
#[derive(Clone)]
pub struct JwtVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtVerifier {
    pub fn new(secret: &Secret<String>) -> Self {
        let bytes = secret.expose_secret().as_bytes();
        Self {
            encoding_key: EncodingKey::from_secret(bytes),
            decoding_key: DecodingKey::from_secret(bytes),
        }
    }

    /// Validate a token and return the user id it was issued for.
    pub fn verify(&self, token: &str) -> Result<Uuid, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        let data = decode::<Claims>(token, &self.decoding_key, &validation)?;
        Uuid::parse_str(&data.claims.sub)
            .map_err(|_| AppError::Unauthorized(anyhow::anyhow!("Token subject is not a user id")))
    }

    /// Issue a token for `user_id` valid for `ttl`.
    pub fn issue(&self, user_id: Uuid, ttl: Duration) -> Result<String, AppError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };
        Ok(encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.encoding_key,
        )?)
    }
}

/// Resolves bearer tokens to active users.
///
/// The last copy of each user seen is kept so requests can still be
/// authenticated while the data store is unreachable.
pub struct UserDirectory {
    verifier: JwtVerifier,
    store: Arc<dyn DataStore>,
    known: DashMap<Uuid, User>,
}

impl UserDirectory {
    pub fn new(verifier: JwtVerifier, store: Arc<dyn DataStore>) -> Self {
        Self {
            verifier,
            store,
            known: DashMap::new(),
        }
    }

    pub fn verifier(&self) -> &JwtVerifier {
        &self.verifier
    }

    /// Resolve a bearer token. Unknown users are 401, inactive users 403.
    #[instrument(skip(self, token))]
    pub async fn authenticate(&self, token: &str) -> Result<User, AppError> {
        let user_id = self.verifier.verify(token)?;

        let user = match self.store.get_user(user_id).await {
            Ok(Some(user)) => {
                self.known.insert(user.id, user.clone());
                user
            }
            Ok(None) => {
                self.known.remove(&user_id);
                return Err(AppError::Unauthorized(anyhow::anyhow!("Unknown user")));
            }
            Err(AppError::ServiceUnavailable) => match self.known.get(&user_id) {
                Some(cached) => {
                    debug!(user_id = %user_id, "Store unreachable, using cached user");
                    cached.clone()
                }
                None => {
                    warn!(user_id = %user_id, "Store unreachable and user not cached");
                    return Err(AppError::ServiceUnavailable);
                }
            },
            Err(e) => return Err(e),
        };

        if !user.is_active {
            return Err(AppError::Forbidden(anyhow::anyhow!("User account is inactive")));
        }
        Ok(user)
    }
}

//! # 客户端认证
//!
//! - 令牌登录：HS256 JWT，claims 中携带 uid
//! - API Key：HMAC-SHA256 签名，原文为 `"GET/realtime" + expires`，expires 为毫秒时间戳

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use push_gateway_core::{GatewayError, Result, current_millis};

use crate::config::GatewayConfig;
use crate::domain::repository::{Authenticator, Identity};

type HmacSha256 = Hmac<Sha256>;

/// 签名原文前缀
pub const SIGNATURE_PREFIX: &str = "GET/realtime";

/// Token Claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// 用户ID
    pub uid: i64,
    /// 过期时间（Unix时间戳，秒）
    pub exp: i64,
}

struct ApiKeyCredential {
    secret: String,
    uid: i64,
}

pub struct GatewayAuthenticator {
    /// JWT密钥，未配置时拒绝令牌登录
    jwt_secret: Option<Vec<u8>>,
    validation: Validation,
    api_keys: HashMap<String, ApiKeyCredential>,
}

impl GatewayAuthenticator {
    pub fn new(jwt_secret: Option<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            jwt_secret: jwt_secret.map(String::into_bytes),
            validation,
            api_keys: HashMap::new(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut auth = Self::new(config.jwt_secret.clone());
        for entry in &config.api_keys {
            auth = auth.with_api_key(&entry.key, &entry.secret, entry.uid);
        }
        auth
    }

    pub fn with_api_key(mut self, key: &str, secret: &str, uid: i64) -> Self {
        self.api_keys.insert(
            key.to_string(),
            ApiKeyCredential {
                secret: secret.to_string(),
                uid,
            },
        );
        self
    }

    /// 计算签名（十六进制）
    pub fn sign(secret: &str, expires: i64) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| GatewayError::Internal(format!("hmac key: {}", e)))?;
        mac.update(SIGNATURE_PREFIX.as_bytes());
        mac.update(expires.to_string().as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl Authenticator for GatewayAuthenticator {
    fn login(&self, token: &str) -> Result<Identity> {
        let secret = self
            .jwt_secret
            .as_ref()
            .ok_or_else(|| GatewayError::Unauthorized("token login disabled".to_string()))?;

        let data = decode::<TokenClaims>(token, &DecodingKey::from_secret(secret), &self.validation)
            .map_err(|e| GatewayError::Unauthorized(format!("token validation failed: {}", e)))?;

        if data.claims.uid <= 0 {
            return Err(GatewayError::Unauthorized("invalid uid in token".to_string()));
        }
        debug!(uid = data.claims.uid, "token authenticated");
        Ok(Identity {
            uid: data.claims.uid,
            api_key: None,
        })
    }

    fn auth(&self, api_key: &str, expires: i64, signature: &str) -> Result<Identity> {
        if expires <= current_millis() {
            return Err(GatewayError::Unauthorized("request expired".to_string()));
        }
        let credential = self
            .api_keys
            .get(api_key)
            .ok_or_else(|| GatewayError::Unauthorized("unknown api key".to_string()))?;

        let expected = hex::decode(signature)
            .map_err(|_| GatewayError::Unauthorized("invalid signature format".to_string()))?;
        let mut mac = HmacSha256::new_from_slice(credential.secret.as_bytes())
            .map_err(|e| GatewayError::Internal(format!("hmac key: {}", e)))?;
        mac.update(SIGNATURE_PREFIX.as_bytes());
        mac.update(expires.to_string().as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| GatewayError::Unauthorized("signature mismatch".to_string()))?;

        debug!(uid = credential.uid, "api key authenticated");
        Ok(Identity {
            uid: credential.uid,
            api_key: Some(api_key.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    #[test]
    fn test_jwt_login() {
        let auth = GatewayAuthenticator::new(Some("secret".into()));
        let claims = TokenClaims {
            uid: 42,
            exp: chrono::Utc::now().timestamp() + 600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert_eq!(auth.login(&token).unwrap().uid, 42);
        assert!(auth.login("garbage").is_err());

        let disabled = GatewayAuthenticator::new(None);
        assert!(disabled.login(&token).is_err());
    }

    #[test]
    fn test_api_key_signature() {
        let auth = GatewayAuthenticator::new(None).with_api_key("k1", "s1", 7);
        let expires = current_millis() + 10_000;
        let sig = GatewayAuthenticator::sign("s1", expires).unwrap();

        let id = auth.auth("k1", expires, &sig).unwrap();
        assert_eq!(id.uid, 7);
        assert_eq!(id.api_key.as_deref(), Some("k1"));

        assert!(auth.auth("k1", expires + 1, &sig).is_err());
        assert!(auth.auth("k2", expires, &sig).is_err());
        let stale = current_millis() - 1;
        let stale_sig = GatewayAuthenticator::sign("s1", stale).unwrap();
        assert!(auth.auth("k1", stale, &stale_sig).is_err());
    }
}

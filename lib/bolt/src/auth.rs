//! Auth tokens. Validation happens client side, before any socket is
//! opened, so obviously broken credentials fail fast.

use crate::error::{Error, Result};
use crate::value::{Value, ValueMap};

/// Container for auth information: a scheme, a principal, credentials, an
/// optional realm, and any further parameters the scheme needs, carried
/// verbatim in the authentication message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthToken {
    pub scheme: String,
    pub principal: String,
    pub credentials: String,
    pub realm: Option<String>,
    pub parameters: ValueMap,
}

impl AuthToken {
    /// Basic user/password authentication.
    pub fn basic<U: Into<String>, P: Into<String>>(user: U, password: P) -> AuthToken {
        AuthToken {
            scheme: "basic".to_string(),
            principal: user.into(),
            credentials: password.into(),
            realm: None,
            parameters: ValueMap::new(),
        }
    }

    pub fn with_realm<R: Into<String>>(mut self, realm: R) -> AuthToken {
        self.realm = Some(realm.into());
        self
    }

    pub fn with_parameter<K: Into<String>>(mut self, key: K, value: Value) -> AuthToken {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Rejects tokens the server would refuse anyway: a missing scheme,
    /// principal or credentials.
    pub fn validate(&self) -> Result<()> {
        if self.scheme.is_empty() {
            return Err(Error::Auth("auth token has no scheme".to_string()));
        }
        if self.principal.is_empty() {
            return Err(Error::Auth("auth token has no principal".to_string()));
        }
        if self.credentials.is_empty() {
            return Err(Error::Auth("auth token has no credentials".to_string()));
        }
        Ok(())
    }

    /// The token as the map transmitted inside INIT/HELLO.
    pub fn to_map(&self) -> ValueMap {
        let mut map = ValueMap::new();
        map.insert("scheme".to_string(), Value::from(self.scheme.as_str()));
        map.insert(
            "principal".to_string(),
            Value::from(self.principal.as_str()),
        );
        map.insert(
            "credentials".to_string(),
            Value::from(self.credentials.as_str()),
        );
        if let Some(realm) = &self.realm {
            map.insert("realm".to_string(), Value::from(realm.as_str()));
        }
        for (key, value) in &self.parameters {
            map.insert(key.clone(), value.clone());
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_token_is_valid() {
        assert!(AuthToken::basic("user", "secret").validate().is_ok());
    }

    #[test]
    fn test_missing_pieces_are_rejected() {
        assert!(AuthToken::basic("", "secret").validate().is_err());
        assert!(AuthToken::basic("user", "").validate().is_err());
        assert!(AuthToken::default().validate().is_err());
    }

    #[test]
    fn test_map_layout() {
        let token = AuthToken::basic("user", "secret")
            .with_realm("native")
            .with_parameter("region", Value::from("eu"));
        let map = token.to_map();
        assert_eq!(map["scheme"], Value::from("basic"));
        assert_eq!(map["principal"], Value::from("user"));
        assert_eq!(map["credentials"], Value::from("secret"));
        assert_eq!(map["realm"], Value::from("native"));
        assert_eq!(map["region"], Value::from("eu"));
    }

    #[test]
    fn test_realm_omitted_by_default() {
        assert!(!AuthToken::basic("user", "secret").to_map().contains_key("realm"));
    }
}

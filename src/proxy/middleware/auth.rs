//! Proxy authentication middleware
//!
//! Handles Basic authentication for the proxy listener against the single
//! configured credential pair.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::header::PROXY_AUTHORIZATION;
use hyper::Request;
use tracing::debug;

use crate::config::Credentials;
use crate::error::{Result, TollgateError};

const BASIC_PREFIX: &str = "Basic ";

/// Proxy authentication handler
#[derive(Clone)]
pub struct ProxyAuth {
    credentials: Arc<Credentials>,
}

impl ProxyAuth {
    /// Create a new proxy auth handler
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials: Arc::new(credentials),
        }
    }

    /// Validate the Proxy-Authorization header.
    ///
    /// A missing or blank header yields [`TollgateError::MissingAuthHeader`],
    /// whose response carries the 407 challenge. Every other failure is a
    /// plain 401. Expects to run inside the request's connection span.
    pub fn validate<T>(&self, req: &Request<T>) -> Result<()> {
        let Some(auth_header) = req
            .headers()
            .get(PROXY_AUTHORIZATION)
            .filter(|value| !value.as_bytes().trim_ascii().is_empty())
        else {
            debug!("No Proxy-Authorization header found");
            return Err(TollgateError::MissingAuthHeader);
        };

        // Parse "Basic <base64>"
        let Some(encoded) = auth_header
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix(BASIC_PREFIX))
        else {
            debug!("Invalid Proxy-Authorization header");
            return Err(TollgateError::InvalidAuthHeader);
        };

        let Ok(decoded) = BASE64.decode(encoded) else {
            debug!("Failed to decode Proxy-Authorization header");
            return Err(TollgateError::MalformedCredentials);
        };

        let payload = String::from_utf8_lossy(&decoded);
        match payload.split_once(':') {
            Some((user, pass))
                if user == self.credentials.username && pass == self.credentials.password =>
            {
                debug!("Proxy authentication successful");
                Ok(())
            }
            _ => {
                debug!("Invalid credentials");
                Err(TollgateError::InvalidCredentials)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::StatusCode;

    fn auth() -> ProxyAuth {
        ProxyAuth::new(Credentials::new("user", "pass"))
    }

    fn create_request_with_auth(auth: Option<&str>) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().uri("http://example.com/");

        if let Some(auth_value) = auth {
            builder = builder.header(PROXY_AUTHORIZATION, auth_value);
        }

        builder.body(Full::new(Bytes::new())).unwrap()
    }

    fn basic(payload: &[u8]) -> String {
        format!("Basic {}", BASE64.encode(payload))
    }

    fn check(header: Option<&str>) -> Result<()> {
        auth().validate(&create_request_with_auth(header))
    }

    #[test]
    fn test_auth_missing_header() {
        let err = check(None).unwrap_err();
        assert!(matches!(err, TollgateError::MissingAuthHeader));
        assert_eq!(err.status_code(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    }

    #[test]
    fn test_auth_blank_header_counts_as_missing() {
        for blank in ["", " ", "\t  "] {
            let err = check(Some(blank)).unwrap_err();
            assert!(
                matches!(err, TollgateError::MissingAuthHeader),
                "header {blank:?} should be treated as missing"
            );
            assert_eq!(err.status_code(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        }
    }

    #[test]
    fn test_auth_valid_credentials() {
        assert!(check(Some(&basic(b"user:pass"))).is_ok());
    }

    #[test]
    fn test_auth_invalid_credentials() {
        let err = check(Some(&basic(b"wrong:wrong"))).unwrap_err();
        assert!(matches!(err, TollgateError::InvalidCredentials));
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_auth_single_character_deviation() {
        for payload in [
            &b"usr:pass"[..],
            b"userx:pass",
            b"User:pass",
            b"user:pas",
            b"user:passs",
            b"user:Pass",
            b"user :pass",
        ] {
            assert!(
                matches!(check(Some(&basic(payload))), Err(TollgateError::InvalidCredentials)),
                "payload {:?} should be rejected",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn test_auth_invalid_scheme() {
        let err = check(Some("Bearer token123")).unwrap_err();
        assert!(matches!(err, TollgateError::InvalidAuthHeader));
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);

        // Scheme match is case-sensitive and needs the separating space
        assert!(matches!(
            check(Some(&basic(b"user:pass").replacen("Basic", "basic", 1))),
            Err(TollgateError::InvalidAuthHeader)
        ));
        assert!(matches!(
            check(Some("Basic")),
            Err(TollgateError::InvalidAuthHeader)
        ));
    }

    #[test]
    fn test_auth_malformed_base64() {
        let err = check(Some("Basic !!!not-base64!!!")).unwrap_err();
        assert!(matches!(err, TollgateError::MalformedCredentials));
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_auth_payload_without_colon() {
        assert!(matches!(
            check(Some(&basic(b"userpass"))),
            Err(TollgateError::InvalidCredentials)
        ));
        assert!(matches!(
            check(Some(&basic(b""))),
            Err(TollgateError::InvalidCredentials)
        ));
    }

    #[test]
    fn test_auth_password_may_contain_colon() {
        let auth = ProxyAuth::new(Credentials::new("user", "pa:ss"));
        let req = create_request_with_auth(Some(&basic(b"user:pa:ss")));
        assert!(auth.validate(&req).is_ok());
    }
}

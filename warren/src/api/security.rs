//! This module provides configuration API of Security and Access Control.
//!
//! The configuration is used as part of [`OpenConnectionArguments`] value.
//!
//! [`OpenConnectionArguments`]: ../connection/struct.OpenConnectionArguments.html
use std::fmt;

use amqp_serde::to_bytes;

use crate::{
    api::{error::Error, Result},
    frame::{long_str, short_str, LongStr},
};

/// Credentials used to open a connection.
#[derive(Clone, PartialEq, Eq)]
pub struct SecurityCredentials {
    username: String,
    password: String,
    mechanism: AuthenticationMechanism,
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, PartialEq, Eq)]
enum AuthenticationMechanism {
    PLAIN,
    AMQPLAIN,
    EXTERNAL,
}

impl SecurityCredentials {
    /// Create and return a SASL/PLAIN credential with given `username` and `password`.
    ///
    /// See [RabbitMQ access control](https://www.rabbitmq.com/access-control.html#mechanisms).
    pub fn new_plain(username: &str, password: &str) -> Self {
        Self {
            username: username.to_owned(),
            password: password.to_owned(),
            mechanism: AuthenticationMechanism::PLAIN,
        }
    }
    /// Create and return a AMQPLAIN credential with given `username` and `password`.
    ///
    /// See [RabbitMQ access control](https://www.rabbitmq.com/access-control.html#mechanisms).
    pub fn new_amqplain(username: &str, password: &str) -> Self {
        Self {
            username: username.to_owned(),
            password: password.to_owned(),
            mechanism: AuthenticationMechanism::AMQPLAIN,
        }
    }

    /// Create and return EXTERNAL without credentials
    ///
    /// The identity is taken from the transport, e.g. a client certificate.
    pub fn new_external() -> Self {
        Self {
            username: "".to_owned(),
            password: "".to_owned(),
            mechanism: AuthenticationMechanism::EXTERNAL,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Get the name of authentication mechanism of current credential
    pub(crate) fn get_mechanism_name(&self) -> &str {
        match self.mechanism {
            AuthenticationMechanism::PLAIN => "PLAIN",
            AuthenticationMechanism::AMQPLAIN => "AMQPLAIN",
            AuthenticationMechanism::EXTERNAL => "EXTERNAL",
        }
    }

    /// Whether the server offers this credential's mechanism.
    pub(crate) fn is_offered(&self, mechanisms: &str) -> bool {
        let name = self.get_mechanism_name();
        mechanisms.split(' ').any(|offered| offered == name)
    }

    /// Get the security `response`, to be sent to server in start-ok.
    pub(crate) fn get_response(&self) -> Result<LongStr> {
        let response = match self.mechanism {
            AuthenticationMechanism::PLAIN => format!("\0{}\0{}", self.username, self.password),
            AuthenticationMechanism::AMQPLAIN => {
                // field table entries without the table's leading size
                let entries = (
                    short_str("LOGIN")?,
                    'S',
                    long_str(self.username.as_str())?,
                    short_str("PASSWORD")?,
                    'S',
                    long_str(self.password.as_str())?,
                );
                let raw = to_bytes(&entries).map_err(|err| Error::AuthError(err.to_string()))?;
                // the length prefixes are only valid UTF-8 below 128
                String::from_utf8(raw).map_err(|_| {
                    Error::AuthError("credentials too long for AMQPLAIN".to_owned())
                })?
            }
            AuthenticationMechanism::EXTERNAL => String::new(),
        };
        Ok(long_str(response)?)
    }

    /// Response to a `connection.secure` challenge. None of the supported
    /// mechanisms is challenge based, so the initial response is repeated.
    pub(crate) fn respond_to_challenge(&self, _challenge: &str) -> Result<LongStr> {
        self.get_response()
    }
}

impl fmt::Debug for SecurityCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityCredentials")
            .field("username", &self.username)
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::SecurityCredentials;
    use crate::api::error::Error;

    #[test]
    fn test_plain_response() {
        let creds = SecurityCredentials::new_plain("user", "secret");
        assert_eq!("\0user\0secret", creds.get_response().unwrap().as_ref().as_str());
        assert!(creds.is_offered("AMQPLAIN PLAIN"));
        assert!(!creds.is_offered("AMQPLAIN EXTERNAL"));
    }

    #[test]
    fn test_amqplain_response_is_bare_table() {
        let creds = SecurityCredentials::new_amqplain("u", "p");
        let response = creds.get_response().unwrap();
        // 5 LOGIN S 0001 u | 8 PASSWORD S 0001 p
        let mut expected = vec![5];
        expected.extend_from_slice(b"LOGINS");
        expected.extend_from_slice(&[0, 0, 0, 1, b'u', 8]);
        expected.extend_from_slice(b"PASSWORDS");
        expected.extend_from_slice(&[0, 0, 0, 1, b'p']);
        assert_eq!(expected, response.as_ref().as_bytes().to_vec());
    }

    #[test]
    fn test_amqplain_refuses_password_with_non_ascii_length() {
        let creds = SecurityCredentials::new_amqplain("u", &"p".repeat(200));
        assert!(matches!(creds.get_response(), Err(Error::AuthError(_))));
    }

    #[test]
    fn test_debug_hides_password() {
        let creds = SecurityCredentials::new_plain("user", "secret");
        assert!(!format!("{:?}", creds).contains("secret"));
    }
}

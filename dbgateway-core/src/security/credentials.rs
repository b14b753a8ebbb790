//! Secret material attached to a stored connection.
//!
//! # Security
//! - Every field lives in a `Zeroizing` container
//! - `Debug` only reports which fields are present

use zeroize::Zeroizing;

/// Decrypted secrets of a connection record.
///
/// # Example
///
/// ```rust
/// use dbgateway_core::security::ConnectionSecrets;
///
/// let secrets = ConnectionSecrets::with_password("hunter2");
/// assert!(secrets.has_password());
/// assert!(!format!("{secrets:?}").contains("hunter2"));
/// ```
#[derive(Clone, Default)]
pub struct ConnectionSecrets {
    /// Engine password
    pub password: Option<Zeroizing<String>>,
    /// PEM-encoded CA certificate
    pub tls_ca_cert: Option<Zeroizing<String>>,
    /// PEM-encoded client certificate
    pub tls_client_cert: Option<Zeroizing<String>>,
    /// PEM-encoded client private key
    pub tls_client_key: Option<Zeroizing<String>>,
}

impl ConnectionSecrets {
    /// Secrets holding only a password.
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            password: Some(Zeroizing::new(password.into())),
            ..Self::default()
        }
    }

    /// Returns the password, if any.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().map(String::as_str)
    }

    /// Checks if a password is present without exposing it.
    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    /// Checks whether any TLS material is present.
    pub fn has_tls_material(&self) -> bool {
        self.tls_ca_cert.is_some() || self.tls_client_cert.is_some() || self.tls_client_key.is_some()
    }

    /// Iterates the secret fields by their vault column name.
    pub(crate) fn fields(&self) -> [(&'static str, Option<&str>); 4] {
        [
            ("password", self.password()),
            ("ssl_ca_cert", self.tls_ca_cert.as_deref().map(String::as_str)),
            (
                "ssl_client_cert",
                self.tls_client_cert.as_deref().map(String::as_str),
            ),
            (
                "ssl_client_key",
                self.tls_client_key.as_deref().map(String::as_str),
            ),
        ]
    }
}

impl std::fmt::Debug for ConnectionSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mask = |present: bool| if present { "<redacted>" } else { "<none>" };
        f.debug_struct("ConnectionSecrets")
            .field("password", &mask(self.password.is_some()))
            .field("tls_ca_cert", &mask(self.tls_ca_cert.is_some()))
            .field("tls_client_cert", &mask(self.tls_client_cert.is_some()))
            .field("tls_client_key", &mask(self.tls_client_key.is_some()))
            .finish()
    }
}

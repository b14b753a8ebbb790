//! Connection URL parsing with immediate secret extraction.
//!
//! # Security
//! - The password is moved into a `Zeroizing` container as soon as it is
//!   percent-decoded
//! - Parse errors never echo the input URL

use zeroize::Zeroizing;

use super::credentials::ConnectionSecrets;
use crate::error::GatewayError;
use crate::models::{EngineFamily, TlsMode};

/// Components of a parsed connection URL.
#[derive(Debug, Clone)]
pub struct ParsedConnectionUrl {
    /// Engine family from the scheme
    pub family: EngineFamily,
    /// Network host
    pub host: Option<String>,
    /// Network port (family default when omitted)
    pub port: Option<u16>,
    /// Database name
    pub database: Option<String>,
    /// Login name
    pub username: Option<String>,
    /// Database file (SQLite)
    pub file_path: Option<String>,
    /// `sslmode` query parameter
    pub tls_mode: Option<TlsMode>,
    /// Password
    pub secrets: ConnectionSecrets,
}

/// Percent-decodes a URL component. Literal `+` and `&` survive.
fn decode(component: &str) -> String {
    let escaped = component.replace('+', "%2B").replace('&', "%26");
    url::form_urlencoded::parse(format!("v={escaped}").as_bytes())
        .next()
        .map_or_else(|| component.to_string(), |(_, v)| v.into_owned())
}

/// Parses a database connection URL.
///
/// # Errors
/// Returns error if the URL is malformed, names an unsupported scheme, or
/// lacks the parts its family needs
///
/// # Example
/// ```rust
/// use dbgateway_core::models::EngineFamily;
/// use dbgateway_core::security::parse_connection_url;
///
/// let parsed = parse_connection_url("mysql://app:pw@db.internal/shop")?;
/// assert_eq!(parsed.family, EngineFamily::Mysql);
/// assert_eq!(parsed.port, Some(3306));
/// assert!(parsed.secrets.has_password());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn parse_connection_url(input: &str) -> crate::Result<ParsedConnectionUrl> {
    let url = url::Url::parse(input).map_err(|e| {
        GatewayError::invalid_field("url", format!("Invalid connection string format: {e}"))
    })?;

    let family: EngineFamily = url.scheme().parse()?;

    if family.is_file_based() {
        // sqlite://relative.db puts the file name in the host slot
        let path = format!("{}{}", url.host_str().unwrap_or_default(), url.path());
        if path.is_empty() || path == "/" {
            return Err(GatewayError::invalid_field(
                "url",
                "Missing file path in sqlite connection string",
            ));
        }
        return Ok(ParsedConnectionUrl {
            family,
            host: None,
            port: None,
            database: None,
            username: None,
            file_path: Some(decode(&path)),
            tls_mode: None,
            secrets: ConnectionSecrets::default(),
        });
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| GatewayError::invalid_field("url", "Missing host in connection string"))?
        .to_string();

    let database = url
        .path()
        .strip_prefix('/')
        .filter(|db| !db.is_empty())
        .map(decode);

    let username = Some(url.username())
        .filter(|u| !u.is_empty())
        .map(decode);

    let secrets = ConnectionSecrets {
        password: url.password().map(|p| Zeroizing::new(decode(p))),
        ..ConnectionSecrets::default()
    };

    let tls_mode = url
        .query_pairs()
        .find(|(key, _)| key == "sslmode" || key == "ssl-mode")
        .map(|(_, value)| value.parse::<TlsMode>())
        .transpose()?;

    Ok(ParsedConnectionUrl {
        family,
        host: Some(host),
        port: url.port().or_else(|| family.default_port()),
        database,
        username,
        file_path: None,
        tls_mode,
        secrets,
    })
}

//! Hub address parsing and certificate profile loading.
//!
//! Two independent pieces of configuration feed a connection attempt:
//!
//! - A **hub specification**: `hostname` or `hostname:port`, with IPv6
//!   literals enclosed in brackets (`[::1]:4859`). The port defaults to the
//!   well-known hub port when omitted.
//! - A **certificate profile specification**: a path to an INI-style file,
//!   optionally suffixed with `[profile]` to select a non-default profile.
//!   Each profile must define `cafile`, `certfile`, and `keyfile`.
//!
//! Both are parsed strictly: malformed input is a reported error, never a
//! silent default.

use std::{fmt, io, net::SocketAddr, sync::Arc};

use ini::Ini;
use tokio_rustls::{
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer, ServerName},
        ClientConfig, RootCertStore,
    },
    TlsConnector,
};

use crate::constants::HUB_PORT;

/// Errors parsing or resolving a hub specification.
#[derive(Debug)]
pub enum HubError {
    /// The specification string did not match `host[:port]`.
    BadSpec(String),
    /// The hostname did not resolve to any address.
    Unresolvable {
        /// Hostname that failed to resolve.
        hostname: String,
        /// Resolver error text.
        detail: String,
    },
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadSpec(spec) => {
                write!(f, "could not understand hub address '{spec}'")
            }
            Self::Unresolvable { hostname, detail } => {
                write!(f, "could not resolve hub hostname '{hostname}': {detail}")
            }
        }
    }
}

impl std::error::Error for HubError {}

/// A resolved hub endpoint.
///
/// Keeps the textual hostname alongside the resolved address; TLS needs the
/// hostname for server-name verification.
#[derive(Debug, Clone)]
pub struct HubEndpoint {
    /// Hostname as given in the specification (brackets stripped).
    pub hostname: String,
    /// Port, explicit or defaulted.
    pub port: u16,
    /// First resolved socket address.
    pub addr: SocketAddr,
}

/// Parse a hub specification into a `(hostname, port)` pair.
///
/// Accepts `hostname`, `hostname:port`, `[v6addr]`, and `[v6addr]:port`.
/// Brackets are stripped from IPv6 literals. An omitted port defaults to
/// [`HUB_PORT`].
///
/// # Errors
///
/// Returns [`HubError::BadSpec`] for anything else, including unbracketed
/// IPv6 literals and non-numeric ports.
pub fn parse_hub(spec: &str) -> Result<(String, u16), HubError> {
    let bad = || HubError::BadSpec(spec.to_string());

    let (hostname, port_part) = if let Some(rest) = spec.strip_prefix('[') {
        // Bracketed IPv6 literal
        let end = rest.find(']').ok_or_else(bad)?;
        let hostname = &rest[..end];
        let tail = &rest[end + 1..];
        if !hostname.chars().all(|c| c.is_ascii_hexdigit() || c == ':') {
            return Err(bad());
        }
        let port_part = if tail.is_empty() {
            None
        } else {
            Some(tail.strip_prefix(':').ok_or_else(bad)?)
        };
        (hostname, port_part)
    } else if let Some((host, port)) = spec.rsplit_once(':') {
        // A colon in the host part means an unbracketed IPv6 literal
        if host.contains(':') {
            return Err(bad());
        }
        (host, Some(port))
    } else {
        (spec, None)
    };

    if hostname.is_empty()
        || hostname
            .chars()
            .any(|c| c.is_whitespace() || c == '[' || c == ']')
    {
        return Err(bad());
    }

    let port = match port_part {
        None => HUB_PORT,
        Some(p) => p.parse::<u16>().map_err(|_| bad())?,
    };

    Ok((hostname.to_string(), port))
}

/// Parse and resolve a hub specification to a connectable endpoint.
///
/// # Errors
///
/// Returns [`HubError::BadSpec`] for a malformed specification or
/// [`HubError::Unresolvable`] when the hostname does not resolve.
pub async fn resolve_hub(spec: &str) -> Result<HubEndpoint, HubError> {
    let (hostname, port) = parse_hub(spec)?;

    let mut addrs = tokio::net::lookup_host((hostname.clone(), port))
        .await
        .map_err(|e| HubError::Unresolvable {
            hostname: hostname.clone(),
            detail: e.to_string(),
        })?;

    let addr = addrs.next().ok_or_else(|| HubError::Unresolvable {
        hostname: hostname.clone(),
        detail: "no addresses returned".to_string(),
    })?;

    Ok(HubEndpoint {
        hostname,
        port,
        addr,
    })
}

/// Errors loading a certificate profile.
///
/// Each failure mode is a distinct variant so callers can report exactly
/// what went wrong: a bad specification, an unreadable file, a missing
/// profile section, or missing keys within a profile.
#[derive(Debug)]
pub enum CertError {
    /// The specification string did not match `path` or `path[profile]`.
    BadSpec(String),
    /// The configuration file could not be read.
    Unreadable {
        /// Expanded path of the configuration file.
        path: String,
        /// Underlying error text.
        detail: String,
    },
    /// The requested profile section is absent from the file.
    MissingProfile {
        /// Profile section name.
        profile: String,
        /// Expanded path of the configuration file.
        path: String,
    },
    /// The profile section is missing one or more required keys.
    MissingKeys {
        /// Profile section name.
        profile: String,
        /// Expanded path of the configuration file.
        path: String,
        /// Missing key names, sorted.
        keys: Vec<&'static str>,
    },
    /// A certificate or key file referenced by the profile was unusable.
    Tls(String),
}

impl fmt::Display for CertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadSpec(spec) => {
                write!(
                    f,
                    "could not understand certificate configuration path '{spec}'"
                )
            }
            Self::Unreadable { path, detail } => {
                write!(
                    f,
                    "could not read certificate configuration file '{path}': {detail}"
                )
            }
            Self::MissingProfile { profile, path } => {
                write!(
                    f,
                    "no such profile [{profile}] in configuration file '{path}'"
                )
            }
            Self::MissingKeys {
                profile,
                path,
                keys,
            } => {
                write!(
                    f,
                    "missing configuration for the following values in the \
                     [{profile}] profile of '{path}': {}",
                    keys.join(", ")
                )
            }
            Self::Tls(detail) => write!(f, "could not set up TLS: {detail}"),
        }
    }
}

impl std::error::Error for CertError {}

/// TLS client wrapper produced from a certificate profile.
///
/// Wraps an established TCP stream in a client-authenticated TLS session.
#[derive(Clone)]
pub struct TlsClient {
    connector: TlsConnector,
}

impl fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClient").finish_non_exhaustive()
    }
}

impl TlsClient {
    /// Wrap `stream` in TLS, verifying the peer as `hostname`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the hostname is not a valid server name or
    /// the handshake fails.
    pub async fn wrap(
        &self,
        stream: tokio::net::TcpStream,
        hostname: &str,
    ) -> io::Result<tokio_rustls::client::TlsStream<tokio::net::TcpStream>> {
        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.connector.connect(server_name, stream).await
    }
}

/// Split a certificate configuration specification into path and profile.
///
/// A `[name]` suffix overrides `default_profile`; its absence leaves the
/// default in effect.
fn parse_cert_conf<'a>(
    spec: &'a str,
    default_profile: &'a str,
) -> Result<(&'a str, &'a str), CertError> {
    let bad = || CertError::BadSpec(spec.to_string());

    match spec.find('[') {
        None => {
            if spec.contains(']') || spec.is_empty() {
                return Err(bad());
            }
            Ok((spec, default_profile))
        }
        Some(idx) => {
            let path = &spec[..idx];
            let profile = spec[idx + 1..].strip_suffix(']').ok_or_else(bad)?;
            if path.is_empty()
                || profile.is_empty()
                || profile.contains(['[', ']'])
                || !profile.chars().all(|c| c.is_alphanumeric() || c == '_')
            {
                return Err(bad());
            }
            Ok((path, profile))
        }
    }
}

/// Required keys in every certificate profile.
const PROFILE_KEYS: [&str; 3] = ["cafile", "certfile", "keyfile"];

/// Load a certificate profile and produce a TLS client wrapper.
///
/// When `secure` is false no wrapper is produced and no file is read.
/// Otherwise `cert_conf` (or the default configuration path) is
/// tilde-expanded and read as an INI file, `profile` selects the section
/// (overridable with a `[name]` suffix on the path), and the section's
/// `cafile`/`certfile`/`keyfile` entries are loaded into a rustls client
/// configuration with client authentication.
///
/// # Errors
///
/// Returns a distinct [`CertError`] variant for each failure mode.
pub fn cert_wrapper(
    cert_conf: Option<&str>,
    profile: &str,
    secure: bool,
) -> Result<Option<TlsClient>, CertError> {
    if !secure {
        return Ok(None);
    }

    let (conf_path, profile) = match cert_conf {
        None => (crate::constants::DEFAULT_CERT_CONF, profile),
        Some(spec) => parse_cert_conf(spec, profile)?,
    };

    let path = shellexpand::tilde(conf_path).into_owned();
    let conf = Ini::load_from_file(&path).map_err(|e| CertError::Unreadable {
        path: path.clone(),
        detail: e.to_string(),
    })?;

    let section = conf
        .section(Some(profile))
        .ok_or_else(|| CertError::MissingProfile {
            profile: profile.to_string(),
            path: path.clone(),
        })?;

    let mut missing: Vec<&'static str> = PROFILE_KEYS
        .iter()
        .copied()
        .filter(|key| section.get(key).is_none())
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        return Err(CertError::MissingKeys {
            profile: profile.to_string(),
            path,
            keys: missing,
        });
    }

    // The filter above guarantees all three keys are present.
    let cafile = section.get("cafile").unwrap_or_default();
    let certfile = section.get("certfile").unwrap_or_default();
    let keyfile = section.get("keyfile").unwrap_or_default();

    let connector = build_connector(cafile, certfile, keyfile)?;
    log::debug!("loaded TLS profile [{profile}] from '{path}'");
    Ok(Some(TlsClient { connector }))
}

/// Build a rustls connector from PEM-encoded CA bundle, certificate chain,
/// and private key paths.
fn build_connector(
    cafile: &str,
    certfile: &str,
    keyfile: &str,
) -> Result<TlsConnector, CertError> {
    let tls_err = |what: &str, detail: String| CertError::Tls(format!("{what}: {detail}"));

    let ca_pem = std::fs::read(cafile)
        .map_err(|e| tls_err(&format!("reading CA bundle '{cafile}'"), e.to_string()))?;
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
        let cert =
            cert.map_err(|e| tls_err(&format!("parsing CA bundle '{cafile}'"), e.to_string()))?;
        roots
            .add(cert)
            .map_err(|e| tls_err(&format!("adding CA certificate from '{cafile}'"), e.to_string()))?;
    }
    if roots.is_empty() {
        return Err(tls_err(
            &format!("parsing CA bundle '{cafile}'"),
            "no certificates found".to_string(),
        ));
    }

    let cert_pem = std::fs::read(certfile)
        .map_err(|e| tls_err(&format!("reading certificate '{certfile}'"), e.to_string()))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| tls_err(&format!("parsing certificate '{certfile}'"), e.to_string()))?;
    if certs.is_empty() {
        return Err(tls_err(
            &format!("parsing certificate '{certfile}'"),
            "no certificates found".to_string(),
        ));
    }

    let key = load_private_key(keyfile)?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| tls_err("building TLS client configuration", e.to_string()))?;

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Load a PEM private key, trying PKCS#8 first and falling back to PKCS#1.
fn load_private_key(keyfile: &str) -> Result<PrivateKeyDer<'static>, CertError> {
    let tls_err = |detail: String| CertError::Tls(format!("loading key '{keyfile}': {detail}"));

    let key_pem = std::fs::read(keyfile).map_err(|e| tls_err(e.to_string()))?;

    let mut pkcs8_pem = key_pem.as_slice();
    let mut pkcs8 = rustls_pemfile::pkcs8_private_keys(&mut pkcs8_pem);
    if let Some(key) = pkcs8.next() {
        return Ok(PrivateKeyDer::Pkcs8(
            key.map_err(|e| tls_err(e.to_string()))?,
        ));
    }

    let mut rsa_pem = key_pem.as_slice();
    let mut rsa = rustls_pemfile::rsa_private_keys(&mut rsa_pem);
    if let Some(key) = rsa.next() {
        return Ok(PrivateKeyDer::Pkcs1(
            key.map_err(|e| tls_err(e.to_string()))?,
        ));
    }

    Err(tls_err("no private key found".to_string()))
}

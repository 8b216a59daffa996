use std::time::Duration;

use url::Url;

use crate::error::TransportError;

/// Default broker address.
pub const DEFAULT_URL: &str = "nats://127.0.0.1:4222";
/// Default client name announced to the broker.
pub const DEFAULT_NAME: &str = "courier";

const SCHEMES: [&str; 3] = ["nats", "tls", "memory"];

/// Options used to establish a connection.
///
/// Every field is handed to the transport as-is at connect time. Boolean
/// flags keep their plain meaning: `randomize = true` shuffles the server
/// list and `echo = true` delivers a connection's own publishes back to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Broker URLs, tried in order unless `randomize` is set.
    pub servers: Vec<String>,
    /// User name for user/password authentication.
    pub user: Option<String>,
    /// Password for user/password authentication.
    pub password: Option<String>,
    /// Authentication token.
    pub token: Option<String>,
    /// Shuffle the server list before connecting.
    pub randomize: bool,
    /// Connect timeout.
    pub timeout: Duration,
    /// Client name announced to the broker.
    pub name: String,
    /// Ask the broker to acknowledge every protocol message.
    pub verbose: bool,
    /// Ask the broker for strict subject checking.
    pub pedantic: bool,
    /// Interval between keep-alive pings.
    pub ping_interval: Duration,
    /// Unanswered pings tolerated before the link is considered dead.
    pub max_pings_outstanding: u32,
    /// Reconnect after a transient disconnect.
    pub allow_reconnect: bool,
    /// Reconnect attempts before giving up, `None` for no limit.
    pub max_reconnect: Option<usize>,
    /// Delay between reconnect attempts.
    pub reconnect_wait: Duration,
    /// Receive messages published by this connection.
    pub echo: bool,
    /// Number of delivery workers, defaults to the available parallelism.
    pub delivery_pool_size: Option<usize>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            servers: vec![DEFAULT_URL.to_string()],
            user: None,
            password: None,
            token: None,
            randomize: true,
            timeout: Duration::from_secs(2),
            name: DEFAULT_NAME.to_string(),
            verbose: false,
            pedantic: false,
            ping_interval: Duration::from_secs(120),
            max_pings_outstanding: 2,
            allow_reconnect: true,
            max_reconnect: Some(60),
            reconnect_wait: Duration::from_secs(2),
            echo: true,
            delivery_pool_size: None,
        }
    }
}

impl ConnectOptions {
    /// Parses a comma separated list of broker URLs.
    ///
    /// Credentials embedded in the first URL that carries any are lifted into
    /// `user`/`password` (or `token` when only a user part is present) and
    /// stripped from the stored server address.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidOption`] if a URL does not parse.
    pub fn from_url(urls: &str) -> Result<Self, TransportError> {
        let mut options = Self {
            servers: Vec::new(),
            ..Self::default()
        };

        for raw in urls.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let mut url = parse_url(raw)?;

            if !url.username().is_empty() && options.user.is_none() && options.token.is_none() {
                match url.password() {
                    Some(password) => {
                        options.user = Some(url.username().to_string());
                        options.password = Some(password.to_string());
                    }
                    None => options.token = Some(url.username().to_string()),
                }
            }

            // Infallible for URLs with a host, which `parse_url` guarantees.
            let _ = url.set_username("");
            let _ = url.set_password(None);
            options.servers.push(url.to_string());
        }

        options.validate()?;
        Ok(options)
    }

    /// Adds a server to the list.
    #[must_use]
    pub fn with_server(mut self, url: impl Into<String>) -> Self {
        self.servers.push(url.into());
        self
    }

    /// Sets user/password authentication.
    #[must_use]
    pub fn with_user_and_password(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Sets token authentication.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Sets the client name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Parsed server URLs in configured order.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidOption`] if a URL does not parse.
    pub fn server_urls(&self) -> Result<Vec<Url>, TransportError> {
        self.servers.iter().map(|s| parse_url(s)).collect()
    }

    /// Checks the options for inconsistencies before any transport is touched.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidOption`] describing the first problem found.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.servers.is_empty() {
            return Err(invalid("at least one server is required"));
        }
        self.server_urls()?;

        match (&self.user, &self.password) {
            (Some(_), None) => return Err(invalid("user given without password")),
            (None, Some(_)) => return Err(invalid("password given without user")),
            _ => {}
        }
        if self.token.is_some() && self.user.is_some() {
            return Err(invalid("token and user/password are mutually exclusive"));
        }
        if self.timeout.is_zero() {
            return Err(invalid("timeout must be non-zero"));
        }
        if self.ping_interval.is_zero() {
            return Err(invalid("ping interval must be non-zero"));
        }
        if self.max_pings_outstanding == 0 {
            return Err(invalid("max pings outstanding must be at least 1"));
        }
        if self.delivery_pool_size == Some(0) {
            return Err(invalid("delivery pool size must be at least 1"));
        }
        if self.name.is_empty() {
            return Err(invalid("client name must not be empty"));
        }
        Ok(())
    }
}

fn parse_url(raw: &str) -> Result<Url, TransportError> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("nats://{raw}")
    };

    let url = Url::parse(&with_scheme)
        .map_err(|e| TransportError::InvalidOption(format!("invalid server url `{raw}`: {e}")))?;

    if !SCHEMES.contains(&url.scheme()) {
        return Err(TransportError::InvalidOption(format!(
            "unsupported scheme `{}` in `{raw}`",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(TransportError::InvalidOption(format!(
            "server url `{raw}` has no host"
        )));
    }
    Ok(url)
}

fn invalid(reason: &str) -> TransportError {
    TransportError::InvalidOption(reason.to_string())
}

use std::path::{Path, PathBuf};

use reqwest::Url;

use crate::types::types::{TransferMetadata, UploadError};

/// Where the uploader looks for its configuration unless told otherwise.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pastit/.env";

const HOST_KEY: &str = "host";
const TOKEN_KEY: &str = "authorization_token";

/// Fully resolved connection settings for the remote.
///
/// Loaded once at process start and passed explicitly to the uploader; the
/// library never reads the process environment on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    pub host: Url,
    pub authorization_token: String,
}

impl UploadConfig {
    pub fn new(host: &str, authorization_token: &str) -> Result<Self, UploadError> {
        let host = host.trim();
        let token = authorization_token.trim();

        if host.is_empty() {
            return Err(UploadError::InvalidConfiguration(format!("`{}` is empty", HOST_KEY)));
        }
        if token.is_empty() {
            return Err(UploadError::InvalidConfiguration(format!("`{}` is empty", TOKEN_KEY)));
        }

        let url = Url::parse(host).map_err(|e| {
            UploadError::InvalidConfiguration(format!("`{}` is not a valid URL ({}): {}", HOST_KEY, host, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(UploadError::InvalidConfiguration(format!(
                "`{}` must be an http(s) URL, got scheme `{}`",
                HOST_KEY,
                url.scheme()
            )));
        }

        Ok(Self {
            host: url,
            authorization_token: token.to_string(),
        })
    }

    /// Reads `host` and `authorization_token` from a dotenv-style file without
    /// touching the process environment.
    pub fn load(path: &Path) -> Result<Self, UploadError> {
        if !path.exists() {
            return Err(UploadError::InvalidConfiguration(format!(
                "config file {} not found (copy {}.example to {} and fill it in)",
                path.display(),
                path.display(),
                path.display()
            )));
        }

        let entries = dotenvy::from_path_iter(path).map_err(|e| {
            UploadError::InvalidConfiguration(format!("cannot read {}: {}", path.display(), e))
        })?;

        let mut pairs = Vec::new();
        for entry in entries {
            let pair = entry.map_err(|e| {
                UploadError::InvalidConfiguration(format!("malformed line in {}: {}", path.display(), e))
            })?;
            pairs.push(pair);
        }

        log::debug!("[config] loaded {} entries from {}", pairs.len(), path.display());
        Self::from_pairs(pairs)
    }

    /// Builds a config from key-value pairs. Later keys win.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, UploadError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut host = None;
        let mut token = None;
        for (key, value) in pairs {
            match key.as_ref() {
                HOST_KEY => host = Some(value.into()),
                TOKEN_KEY => token = Some(value.into()),
                _ => {}
            }
        }

        match (host, token) {
            (Some(host), Some(token)) => Self::new(&host, &token),
            (None, _) => Err(UploadError::InvalidConfiguration(format!("`{}` not set", HOST_KEY))),
            (_, None) => Err(UploadError::InvalidConfiguration(format!("`{}` not set", TOKEN_KEY))),
        }
    }

    /// `{host}/api/upload`, tolerant of a trailing slash or a path prefix on
    /// the host.
    pub fn upload_endpoint(&self) -> String {
        format!("{}/api/upload", self.host.as_str().trim_end_matches('/'))
    }

    /// Metadata template pointing at this config's endpoint and credential.
    pub fn metadata(&self) -> TransferMetadata {
        TransferMetadata::new(self.upload_endpoint(), self.authorization_token.clone())
    }
}

/// Resolves the config path: an explicit path wins, then `PASTA_CONFIG`,
/// then [`DEFAULT_CONFIG_PATH`].
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os("PASTA_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

//! Release source: where the updater learns the latest published version.
//!
//! Any implementation returning a semver-ordered version string satisfies
//! the contract. The default implementation speaks the plain-text protocol
//! of the release server: `GET <releaseURL>/version` returns the trimmed
//! version string as the body.

use std::time::Duration;

use thiserror::Error;

/// Overall client timeout; individual calls tighten this per request.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from consulting a release source. These are transient by nature
/// (network flakiness is normal) and callers on periodic paths log and
/// continue.
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// Transport-level failure (DNS, connect, timeout, body read).
    #[error("release request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The release server answered outside 2xx.
    #[error("unexpected status code {0} from release source")]
    Status(u16),

    /// The release server answered 2xx with an empty body.
    #[error("empty version response from release source")]
    EmptyBody,
}

/// Source of the latest published version string.
pub trait ReleaseSource: Send + Sync {
    /// Fetches the latest version, bounded by `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError`] when the source cannot be reached or
    /// answers garbage.
    fn latest_version(&self, deadline: Duration, release_url: &str) -> Result<String, ReleaseError>;
}

/// [`ReleaseSource`] over HTTP, for any server exposing `/version`.
#[derive(Debug)]
pub struct HttpReleaseSource {
    client: reqwest::blocking::Client,
}

impl HttpReleaseSource {
    /// Builds the source with its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::Http`] when the TLS backend cannot be
    /// initialized.
    pub fn new() -> Result<Self, ReleaseError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(CLIENT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

impl ReleaseSource for HttpReleaseSource {
    fn latest_version(&self, deadline: Duration, release_url: &str) -> Result<String, ReleaseError> {
        let url = version_url(release_url);
        let response = self.client.get(url).timeout(deadline).send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReleaseError::Status(status.as_u16()));
        }

        let body = response.text()?;
        let version = body.trim();
        if version.is_empty() {
            return Err(ReleaseError::EmptyBody);
        }
        Ok(version.to_string())
    }
}

fn version_url(release_url: &str) -> String {
    format!("{}/version", release_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_url_normalizes_trailing_slash() {
        assert_eq!(
            version_url("https://releases.example.com/molt/"),
            "https://releases.example.com/molt/version"
        );
        assert_eq!(
            version_url("https://releases.example.com/molt"),
            "https://releases.example.com/molt/version"
        );
    }
}

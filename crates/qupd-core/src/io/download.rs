//! Release sources: where the manifest and the encrypted asset come from.
//!
//! Downloads stream to disk with an incremental SHA-256 and a hard byte cap,
//! so an oversized or hostile response never lands in full.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use qupd_schema::Sha256Digest;
use reqwest::{Client, Url};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::Reporter;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("asset exceeds the declared size of {limit} bytes")]
    TooLarge { limit: u64 },
}

/// A completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedAsset {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: Sha256Digest,
}

/// Where releases are published.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Fetch the release manifest document.
    async fn fetch_manifest(&self) -> Result<String, SourceError>;

    /// Download `asset_name` to `dest`, failing once more than `max_len`
    /// bytes arrive.
    async fn download_asset(
        &self,
        asset_name: &str,
        dest: &Path,
        max_len: u64,
        reporter: &dyn Reporter,
    ) -> Result<DownloadedAsset, SourceError>;

    /// The asset name this source publishes, when it knows one.
    fn expected_asset_name(&self) -> Option<&str> {
        None
    }
}

/// Stream `chunks` into `dest`, hashing as it goes.
async fn write_capped<S, B, E>(
    chunks: S,
    dest: &Path,
    max_len: u64,
    reporter: &dyn Reporter,
) -> Result<DownloadedAsset, SourceError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    SourceError: From<E>,
{
    let mut chunks = std::pin::pin!(chunks);
    let mut file = File::create(dest).await?;
    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;
    reporter.downloading(0, Some(max_len));

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        let chunk = chunk.as_ref();
        downloaded += chunk.len() as u64;
        if downloaded > max_len {
            drop(file);
            tokio::fs::remove_file(dest).await.ok();
            return Err(SourceError::TooLarge { limit: max_len });
        }
        file.write_all(chunk).await?;
        hasher.update(chunk);
        reporter.downloading(downloaded, Some(max_len));
    }
    file.flush().await?;

    Ok(DownloadedAsset {
        path: dest.to_path_buf(),
        size: downloaded,
        sha256: Sha256Digest::from_bytes(hasher.finalize().into()),
    })
}

/// Releases served over HTTP(S).
///
/// Without an explicit asset URL, the asset is resolved relative to the
/// manifest URL.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    manifest_url: Url,
    asset_url: Option<Url>,
    asset_name: Option<String>,
}

fn parse_url(url: &str) -> Result<Url, SourceError> {
    Url::parse(url).map_err(|e| SourceError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

impl HttpSource {
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidUrl`] for an unparseable URL, or
    /// [`SourceError::Http`] if the client cannot be built.
    pub fn new(manifest_url: &str, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            manifest_url: parse_url(manifest_url)?,
            asset_url: None,
            asset_name: None,
        })
    }

    /// Use a fixed asset URL. Its last path segment becomes the expected
    /// asset name.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidUrl`] for an unparseable URL.
    pub fn with_asset_url(mut self, asset_url: &str) -> Result<Self, SourceError> {
        let url = parse_url(asset_url)?;
        self.asset_name = url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        self.asset_url = Some(url);
        Ok(self)
    }

    fn asset_url_for(&self, asset_name: &str) -> Result<Url, SourceError> {
        if let Some(url) = &self.asset_url {
            return Ok(url.clone());
        }
        self.manifest_url
            .join(asset_name)
            .map_err(|e| SourceError::InvalidUrl {
                url: asset_name.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl ReleaseSource for HttpSource {
    async fn fetch_manifest(&self) -> Result<String, SourceError> {
        debug!(url = %self.manifest_url, "fetching release manifest");
        let text = self
            .client
            .get(self.manifest_url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(text)
    }

    async fn download_asset(
        &self,
        asset_name: &str,
        dest: &Path,
        max_len: u64,
        reporter: &dyn Reporter,
    ) -> Result<DownloadedAsset, SourceError> {
        let url = self.asset_url_for(asset_name)?;
        debug!(%url, dest = %dest.display(), "downloading release asset");
        let response = self.client.get(url).send().await?.error_for_status()?;

        if response.content_length().is_some_and(|len| len > max_len) {
            return Err(SourceError::TooLarge { limit: max_len });
        }
        write_capped(response.bytes_stream(), dest, max_len, reporter).await
    }

    fn expected_asset_name(&self) -> Option<&str> {
        self.asset_name.as_deref()
    }
}

/// Releases published to a local directory (mounted share, test fixture).
#[derive(Debug, Clone)]
pub struct LocalSource {
    dir: PathBuf,
    manifest_name: String,
    asset_name: Option<String>,
}

impl LocalSource {
    /// Default manifest file name.
    pub const MANIFEST_NAME: &'static str = "latest.yml";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            manifest_name: Self::MANIFEST_NAME.to_string(),
            asset_name: None,
        }
    }

    /// A source whose manifest is the file at `path`.
    pub fn from_manifest_path(path: &Path) -> Self {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut source = Self::new(dir);
        if let Some(name) = path.file_name() {
            source.manifest_name = name.to_string_lossy().into_owned();
        }
        source
    }

    /// Require the manifest to name `asset_name`.
    pub fn with_asset_name(mut self, asset_name: impl Into<String>) -> Self {
        self.asset_name = Some(asset_name.into());
        self
    }
}

#[async_trait]
impl ReleaseSource for LocalSource {
    async fn fetch_manifest(&self) -> Result<String, SourceError> {
        Ok(tokio::fs::read_to_string(self.dir.join(&self.manifest_name)).await?)
    }

    async fn download_asset(
        &self,
        asset_name: &str,
        dest: &Path,
        max_len: u64,
        reporter: &dyn Reporter,
    ) -> Result<DownloadedAsset, SourceError> {
        let file = File::open(self.dir.join(asset_name)).await?;
        write_capped(ReaderStream::new(file), dest, max_len, reporter).await
    }

    fn expected_asset_name(&self) -> Option<&str> {
        self.asset_name.as_deref()
    }
}

/// Pick a source for `location`: HTTP(S) URLs get an [`HttpSource`],
/// anything else is a local manifest path.
///
/// # Errors
///
/// Returns [`SourceError::InvalidUrl`] if a URL does not parse.
pub fn source_for(
    location: &str,
    asset_url: Option<&str>,
    timeout: Duration,
) -> Result<Box<dyn ReleaseSource>, SourceError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        let mut source = HttpSource::new(location, timeout)?;
        if let Some(asset_url) = asset_url {
            source = source.with_asset_url(asset_url)?;
        }
        return Ok(Box::new(source));
    }
    let location = location.strip_prefix("file://").unwrap_or(location);
    Ok(Box::new(LocalSource::from_manifest_path(Path::new(location))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NullReporter;
    use mockito::Server;

    #[tokio::test]
    async fn http_source_fetches_and_hashes() {
        let mut server = Server::new_async().await;
        let _manifest = server
            .mock("GET", "/releases/latest.yml")
            .with_status(200)
            .with_body("version: 1.0.0\n")
            .create_async()
            .await;
        let _asset = server
            .mock("GET", "/releases/app-1.0.0.qupd")
            .with_status(200)
            .with_body("asset bytes")
            .create_async()
            .await;

        let url = format!("{}/releases/latest.yml", server.url());
        let source = HttpSource::new(&url, Duration::from_secs(5)).unwrap();
        assert_eq!(source.fetch_manifest().await.unwrap(), "version: 1.0.0\n");
        assert_eq!(source.expected_asset_name(), None);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("asset");
        let got = source
            .download_asset("app-1.0.0.qupd", &dest, 1024, &NullReporter)
            .await
            .unwrap();
        assert_eq!(got.size, 11);
        assert_eq!(got.sha256, Sha256Digest::compute(b"asset bytes"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"asset bytes");
    }

    #[tokio::test]
    async fn http_source_enforces_cap() {
        let mut server = Server::new_async().await;
        let _asset = server
            .mock("GET", "/app.qupd")
            .with_status(200)
            .with_body("0123456789")
            .create_async()
            .await;

        let url = format!("{}/latest.yml", server.url());
        let source = HttpSource::new(&url, Duration::from_secs(5)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("asset");
        let err = source
            .download_asset("app.qupd", &dest, 4, &NullReporter)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::TooLarge { limit: 4 }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn http_error_status_fails() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/latest.yml")
            .with_status(404)
            .create_async()
            .await;
        let source =
            HttpSource::new(&format!("{}/latest.yml", server.url()), Duration::from_secs(5))
                .unwrap();
        assert!(matches!(
            source.fetch_manifest().await,
            Err(SourceError::Http(_))
        ));
    }

    #[test]
    fn explicit_asset_url_sets_expected_name() {
        let source = HttpSource::new("https://example.com/latest.yml", Duration::from_secs(5))
            .unwrap()
            .with_asset_url("https://cdn.example.com/v2/app-2.0.0.qupd")
            .unwrap();
        assert_eq!(source.expected_asset_name(), Some("app-2.0.0.qupd"));
    }

    #[tokio::test]
    async fn local_source_copies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("latest.yml"), "version: 2.0.0\n").unwrap();
        std::fs::write(dir.path().join("app.qupd"), b"local").unwrap();

        let source = source_for(
            dir.path().join("latest.yml").to_str().unwrap(),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(source.fetch_manifest().await.unwrap(), "version: 2.0.0\n");

        let dest = dir.path().join("copy");
        let got = source
            .download_asset("app.qupd", &dest, 5, &NullReporter)
            .await
            .unwrap();
        assert_eq!(got.sha256, Sha256Digest::compute(b"local"));
    }
}

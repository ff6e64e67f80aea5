//! HTTP artifact downloads (release archives, standalone scripts).
//!
//! Bodies are streamed into `<dest>.part` and renamed into place once
//! complete, so an interrupted download never leaves a truncated file at
//! the destination.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{AdapterError, AdapterResult, ExitInfo, Fetcher, Outcome};

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("provision/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    fn partial_path(destination: &Path) -> PathBuf {
        let mut name = destination.as_os_str().to_os_string();
        name.push(".part");
        PathBuf::from(name)
    }

    async fn fetch(&self, url: &str, destination: &Path, cancel: &CancellationToken) -> AdapterResult {
        let http_err = |source: reqwest::Error| AdapterError::Http {
            url: url.to_string(),
            source,
        };

        let mut response = self.client.get(url).send().await.map_err(http_err)?;
        let status = response.status();
        if !status.is_success() {
            return Ok(Outcome {
                success: false,
                exit: ExitInfo::Internal,
                stdout: String::new(),
                stderr: format!("GET {} returned {}", url, status),
            });
        }

        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| AdapterError::io("create parent directory", parent, e))?;
        }

        let partial = Self::partial_path(destination);
        let mut file = fs::File::create(&partial)
            .await
            .map_err(|e| AdapterError::io("create", &partial, e))?;

        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(http_err)? {
            if cancel.is_cancelled() {
                drop(file);
                let _ = fs::remove_file(&partial).await;
                return Err(AdapterError::cancelled(format!("GET {}", url)));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| AdapterError::io("write", &partial, e))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| AdapterError::io("flush", &partial, e))?;
        drop(file);

        fs::rename(&partial, destination)
            .await
            .map_err(|e| AdapterError::io("rename", destination, e))?;

        debug!(url, bytes = written, dest = %destination.display(), "Downloaded");
        Ok(Outcome::ok().with_stdout(format!("{} bytes", written)))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn download(&self, url: &str, destination: &Path, cancel: &CancellationToken) -> AdapterResult {
        tokio::select! {
            result = self.fetch(url, destination, cancel) => result,
            _ = cancel.cancelled() => {
                let _ = fs::remove_file(Self::partial_path(destination)).await;
                Err(AdapterError::cancelled(format!("GET {}", url)))
            }
        }
    }
}

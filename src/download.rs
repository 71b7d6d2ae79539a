use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::domain::FileId;
use crate::error::KiraError;
use crate::gdc::{default_headers, handle_status};

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(&self, file_id: &FileId, destination: &Path) -> Result<u64, KiraError>;
}

#[derive(Clone)]
pub struct GdcDownloader {
    client: Client,
    base_url: String,
}

impl GdcDownloader {
    /// No total timeout here; callers bound each download themselves.
    pub fn new(base_url: &str) -> Result<Self, KiraError> {
        let client = Client::builder()
            .default_headers(default_headers()?)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(KiraError::from_reqwest)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn file_url(&self, file_id: &FileId) -> String {
        format!("{}/data/{}", self.base_url, file_id.as_str())
    }
}

#[async_trait]
impl Downloader for GdcDownloader {
    async fn fetch(&self, file_id: &FileId, destination: &Path) -> Result<u64, KiraError> {
        let response = self
            .client
            .get(self.file_url(file_id))
            .send()
            .await
            .map_err(KiraError::from_reqwest)?;
        let response = handle_status(response).await?;

        let mut file = File::create(destination)
            .await
            .map_err(|err| KiraError::Filesystem(format!("create {}: {err}", destination.display())))?;
        let mut written = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(KiraError::from_reqwest)?;
            file.write_all(&chunk).await.map_err(KiraError::filesystem)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(KiraError::filesystem)?;
        Ok(written)
    }
}

//! Utility functions
//!
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use reqwest::Client;
use tokio::{fs, io::AsyncWriteExt};

/// Download a file from a URL to a given filepath.
///
/// The body lands in a `.part` sibling and is renamed to `filepath` once complete.
pub async fn download_file(client: &Client, url: &str, filepath: impl AsRef<Path>) -> Result<()> {
    let filepath = filepath.as_ref();
    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        bail!("download of {} failed with status {}", url, resp.status());
    }

    if let Some(parent) = filepath.parent() {
        fs::create_dir_all(parent).await?;
    }

    let partial = filepath.with_extension("part");
    let mut file = fs::File::create(&partial).await?;
    file.write_all(&resp.bytes().await?).await?;
    file.flush().await?;
    fs::rename(&partial, filepath).await?;

    Ok(())
}

/// Default directory to look for and store model files.
pub fn models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("presence_cam")
        .join("models")
}

/// Seconds since the unix epoch.
pub fn unix_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

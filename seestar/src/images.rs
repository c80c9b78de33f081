//! Image storage: listing, download over the file channel, deletion

use crate::client::SeestarClient;
use crate::error::{SeestarError, SeestarResult};
use crate::protocol::methods;
use crate::transport;
use serde::Serialize;
use serde_json::{json, Value};
use std::str::FromStr;

/// Stacked results on the device
pub const STACK_DIR: &str = "/mnt/seestar/stack/";

/// Individual sub-frames on the device
pub const RAW_DIR: &str = "/mnt/seestar/raw/";

/// Which image directory to look at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Stacked,
    Raw,
    All,
}

impl ImageKind {
    fn includes(&self, other: ImageKind) -> bool {
        *self == ImageKind::All || *self == other
    }
}

impl FromStr for ImageKind {
    type Err = SeestarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stacked" => Ok(ImageKind::Stacked),
            "raw" => Ok(ImageKind::Raw),
            "all" => Ok(ImageKind::All),
            other => Err(SeestarError::InvalidInput(format!(
                "Invalid image type '{}'. Must be one of: stacked, raw, all",
                other
            ))),
        }
    }
}

/// One file in device storage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageInfo {
    pub filename: String,
    pub size: u64,
    pub timestamp: String,
    /// File format reported by the device; `fits` when omitted
    pub format: String,
    #[serde(rename = "type")]
    pub kind: ImageKind,
}

impl ImageInfo {
    fn from_entry(entry: &Value, kind: ImageKind) -> Self {
        let text = |key: &str, default: &str| {
            entry
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };
        Self {
            filename: text("name", ""),
            size: entry.get("size").and_then(Value::as_u64).unwrap_or(0),
            timestamp: text("timestamp", ""),
            format: text("format", "fits"),
            kind,
        }
    }
}

fn parse_listing(listing: &Value, kind: ImageKind) -> Vec<ImageInfo> {
    listing
        .get("files")
        .and_then(Value::as_array)
        .map(|files| {
            files
                .iter()
                .map(|entry| ImageInfo::from_entry(entry, kind))
                .collect()
        })
        .unwrap_or_default()
}

/// Plain file name: no separators, no parent references
fn validate_file_name(filename: &str) -> SeestarResult<()> {
    if filename.is_empty() || filename.contains('/') || filename.contains("..") {
        return Err(SeestarError::InvalidInput(format!(
            "Invalid image file name '{}'",
            filename
        )));
    }
    Ok(())
}

/// Device path safe to hand to `rm`
fn validate_remote_path(path: &str) -> SeestarResult<()> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-');
    if path.is_empty() || path.contains("..") || !path.chars().all(allowed) {
        return Err(SeestarError::InvalidInput(format!(
            "Refusing to delete '{}'",
            path
        )));
    }
    Ok(())
}

impl SeestarClient {
    /// File or directory information; an empty path queries the default location
    pub async fn get_image_file_info(&self, path: &str) -> SeestarResult<Value> {
        let params = if path.is_empty() {
            json!({})
        } else {
            json!({ "name": path })
        };
        self.query(methods::GET_IMG_FILE_INFO, Some(params)).await
    }

    pub async fn list_images(&self, kind: ImageKind) -> SeestarResult<Vec<ImageInfo>> {
        tracing::info!("Listing images of type: {:?}", kind);
        let mut images = Vec::new();
        if kind.includes(ImageKind::Stacked) {
            let listing = self.get_image_file_info(STACK_DIR).await?;
            images.extend(parse_listing(&listing, ImageKind::Stacked));
        }
        if kind.includes(ImageKind::Raw) {
            let listing = self.get_image_file_info(RAW_DIR).await?;
            images.extend(parse_listing(&listing, ImageKind::Raw));
        }
        tracing::info!("Found {} images", images.len());
        Ok(images)
    }

    /// Download a stacked image by file name
    pub async fn get_stacked_image(&self, filename: &str) -> SeestarResult<Vec<u8>> {
        validate_file_name(filename)?;
        tracing::info!("Downloading stacked image: {}", filename);
        self.download(&format!("{}{}", STACK_DIR, filename)).await
    }

    /// Download a raw sub-frame by file name
    pub async fn get_raw_frame(&self, filename: &str) -> SeestarResult<Vec<u8>> {
        validate_file_name(filename)?;
        tracing::info!("Downloading raw frame: {}", filename);
        self.download(&format!("{}{}", RAW_DIR, filename)).await
    }

    async fn download(&self, remote_path: &str) -> SeestarResult<Vec<u8>> {
        let host = self.host().ok_or(SeestarError::NotConnected)?;
        transport::download_file(
            &host,
            self.config().file_transfer_port,
            remote_path,
            self.config().connection_timeout(),
        )
        .await
    }

    /// Delete a file by full device path
    pub async fn delete_image(&self, path: &str) -> SeestarResult<bool> {
        validate_remote_path(path)?;
        tracing::info!("Deleting image: {}", path);
        let deleted = self
            .command_accepted(methods::PI_EXECUTE_CMD, json!({ "cmd": format!("rm {}", path) }))
            .await?;
        tracing::info!("Delete {}", if deleted { "successful" } else { "failed" });
        Ok(deleted)
    }
}

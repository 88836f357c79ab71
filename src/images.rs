use std::io;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::digest;
use crate::error::{Error, Result};
use crate::store::{Store, IMAGE_EXT};
use crate::xattrs::{self, HASH_ATTR};

/// Client-visible properties of a stored image blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageInfo {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
}

impl ImageInfo {
    fn available(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            kind: "apptainer".to_string(),
            status: "available".to_string(),
        }
    }
}

/// Store for raw container image blobs, one `<name>.sif` file per image.
///
/// Replacement of an existing image requires the caller to present the
/// stored etag; the new etag is returned on every successful write.
#[derive(Debug, Clone)]
pub struct Images {
    store: Store,
}

impl Images {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Store `bytes` as image `name`.
    pub async fn put(&self, name: &str, bytes: Bytes, client_etag: Option<&str>) -> Result<String> {
        validate_name(name)?;
        if bytes.is_empty() {
            return Err(Error::invalid("File is empty"));
        }

        let path = self.store.image_path(name);
        if fs::try_exists(&path).await? {
            let current = self.etag(name).await?;
            match client_etag {
                None => return Err(Error::PreconditionRequired { current }),
                Some(tag) if tag != current => return Err(Error::PreconditionFailed),
                Some(_) => {}
            }
        }

        let etag = digest::etag(&bytes);
        fs::write(&path, &bytes).await?;
        xattrs::set(&path, HASH_ATTR, etag.as_bytes())?;
        info!("stored image {} ({} bytes)", name, bytes.len());
        Ok(etag)
    }

    /// Raw bytes of image `name`.
    pub async fn get(&self, name: &str) -> Result<Bytes> {
        let path = self.store.image_path(name);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes.into()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(not_found(name)),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn properties(&self, name: &str) -> Result<ImageInfo> {
        let path = self.store.image_path(name);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(ImageInfo::available(name, meta.len())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(not_found(name)),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self.store.image_path(name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(not_found(name)),
            Err(err) => Err(err.into()),
        }
    }

    /// All stored images ordered by name ascending, windowed by
    /// `skip`/`limit`. Returns the total count alongside the window.
    pub async fn list(&self, skip: usize, limit: usize) -> Result<(usize, Vec<ImageInfo>)> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(self.store.images_root()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(name) = file_name.strip_suffix(&format!(".{IMAGE_EXT}")) {
                names.push(name.to_string());
            }
        }
        names.sort_unstable();

        let total = names.len();
        let mut items = Vec::new();
        for name in names.into_iter().skip(skip).take(limit) {
            items.push(self.properties(&name).await?);
        }
        Ok((total, items))
    }

    /// Current etag of a stored image: the recorded hash, recomputed from
    /// the bytes when the attribute has been lost.
    pub(crate) async fn etag(&self, name: &str) -> Result<String> {
        let path = self.store.image_path(name);
        match xattrs::get_string(&path, HASH_ATTR)? {
            Some(tag) => Ok(tag),
            None => {
                let bytes = fs::read(&path).await?;
                Ok(digest::etag(&bytes))
            }
        }
    }
}

fn not_found(name: &str) -> Error {
    Error::not_found(format!("Image '{name}' not found"))
}

/// Image names become `<name>.sif` files in the image root, so anything
/// that would escape the directory or masquerade as another file type is
/// rejected up front.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid("Image name is required"));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(Error::invalid("Invalid image name"));
    }
    match std::path::Path::new(name).extension().and_then(|ext| ext.to_str()) {
        None => Ok(()),
        Some(ext) if ext == IMAGE_EXT => Ok(()),
        Some(_) => Err(Error::invalid("File must be a .sif file")),
    }
}

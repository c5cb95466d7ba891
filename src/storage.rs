//! Flat key-value blob storage.
//!
//! Production runs against S3. Local runs and tests use a directory tree laid
//! out as `{root}/{bucket}/{key}`.

use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};

use aws_sdk_s3::primitives::ByteStream;
use serde::{Deserialize, Serialize};
use tokio::{fs, io};

use crate::{aws::load_aws_config, prelude::*};

/// Where a blob lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct BlobLocation {
    pub bucket: String,
    pub key: String,
}

impl BlobLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for BlobLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

impl FromStr for BlobLocation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("s3://")
            .ok_or_else(|| anyhow!("expected an s3://bucket/key URL, got {:?}", s))?;
        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(Self::new(bucket, key))
            }
            _ => Err(anyhow!("expected an s3://bucket/key URL, got {:?}", s)),
        }
    }
}

/// Content type and user metadata stored alongside a blob.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct BlobMetadata {
    pub content_type: Option<String>,
    pub user: BTreeMap<String, String>,
}

impl BlobMetadata {
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            user: BTreeMap::new(),
        }
    }

    pub fn insert(mut self, key: &str, value: impl ToString) -> Self {
        self.user.insert(key.to_owned(), value.to_string());
        self
    }

    /// Our content type, or one guessed from the key.
    fn content_type_for(&self, key: &str) -> String {
        self.content_type.clone().unwrap_or_else(|| {
            mime_guess::from_path(key)
                .first_or_octet_stream()
                .essence_str()
                .to_owned()
        })
    }
}

/// Blob storage interface.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Read a whole blob into memory.
    async fn get(&self, location: &BlobLocation) -> Result<Vec<u8>>;

    /// Write a blob, replacing any existing one.
    async fn put(
        &self,
        location: &BlobLocation,
        data: Vec<u8>,
        metadata: &BlobMetadata,
    ) -> Result<()>;

    /// Does this blob exist?
    async fn exists(&self, location: &BlobLocation) -> Result<bool>;

    /// Stream a blob to a local file.
    async fn download_to(&self, location: &BlobLocation, path: &Path) -> Result<()>;

    /// Stream a local file into a blob.
    async fn upload_from(
        &self,
        location: &BlobLocation,
        path: &Path,
        metadata: &BlobMetadata,
    ) -> Result<()>;
}

/// S3-backed [`BlobStore`].
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
}

impl S3BlobStore {
    pub async fn new() -> Result<Arc<dyn BlobStore>> {
        let config = load_aws_config().await?;
        Ok(Arc::new(Self {
            client: aws_sdk_s3::Client::new(&config),
        }))
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(level = "debug", skip_all, fields(%location))]
    async fn get(&self, location: &BlobLocation) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .with_context(|| format!("failed to get {location}"))?;
        let data = response
            .body
            .collect()
            .await
            .with_context(|| format!("failed to read body of {location}"))?
            .into_bytes()
            .to_vec();
        Ok(data)
    }

    #[instrument(level = "debug", skip_all, fields(%location, bytes = data.len()))]
    async fn put(
        &self,
        location: &BlobLocation,
        data: Vec<u8>,
        metadata: &BlobMetadata,
    ) -> Result<()> {
        self.client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .body(ByteStream::from(data))
            .content_type(metadata.content_type_for(&location.key))
            .set_metadata(Some(metadata.user.clone().into_iter().collect()))
            .send()
            .await
            .with_context(|| format!("failed to put {location}"))?;
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(%location))]
    async fn exists(&self, location: &BlobLocation) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().is_some_and(|err| err.is_not_found()) => {
                Ok(false)
            }
            Err(err) => Err(err).with_context(|| format!("failed to check {location}")),
        }
    }

    #[instrument(level = "debug", skip_all, fields(%location, path = %path.display()))]
    async fn download_to(&self, location: &BlobLocation, path: &Path) -> Result<()> {
        let response = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .with_context(|| format!("failed to get {location}"))?;
        let mut reader = std::pin::pin!(response.body.into_async_read());
        let mut file = fs::File::create(path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))?;
        io::copy(&mut reader, &mut file)
            .await
            .with_context(|| format!("failed to download {location}"))?;
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(%location, path = %path.display()))]
    async fn upload_from(
        &self,
        location: &BlobLocation,
        path: &Path,
        metadata: &BlobMetadata,
    ) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        self.client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .body(body)
            .content_type(metadata.content_type_for(&location.key))
            .set_metadata(Some(metadata.user.clone().into_iter().collect()))
            .send()
            .await
            .with_context(|| format!("failed to upload {location}"))?;
        Ok(())
    }
}

/// Directory-backed [`BlobStore`]. User metadata is written next to each blob
/// as `{key}.metadata.json`.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The file backing a blob.
    pub fn path_for(&self, location: &BlobLocation) -> Result<PathBuf> {
        let relative = Path::new(&location.bucket).join(&location.key);
        if relative
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(anyhow!("refusing to map {location} outside the store root"));
        }
        Ok(self.root.join(relative))
    }

    fn metadata_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".metadata.json");
        PathBuf::from(name)
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Ok(())
    }

    async fn write_metadata(path: &Path, metadata: &BlobMetadata) -> Result<()> {
        let json = serde_json::to_vec_pretty(metadata)?;
        fs::write(Self::metadata_path(path), json)
            .await
            .with_context(|| format!("failed to write metadata for {}", path.display()))
    }

    /// Read the metadata stored with a blob.
    pub async fn metadata(&self, location: &BlobLocation) -> Result<BlobMetadata> {
        let path = Self::metadata_path(&self.path_for(location)?);
        let json = fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(serde_json::from_slice(&json)?)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, location: &BlobLocation) -> Result<Vec<u8>> {
        let path = self.path_for(location)?;
        fs::read(&path)
            .await
            .with_context(|| format!("failed to read {location} from {}", path.display()))
    }

    async fn put(
        &self,
        location: &BlobLocation,
        data: Vec<u8>,
        metadata: &BlobMetadata,
    ) -> Result<()> {
        let path = self.path_for(location)?;
        Self::ensure_parent(&path).await?;
        fs::write(&path, data)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Self::write_metadata(&path, metadata).await
    }

    async fn exists(&self, location: &BlobLocation) -> Result<bool> {
        Ok(fs::try_exists(self.path_for(location)?).await?)
    }

    async fn download_to(&self, location: &BlobLocation, path: &Path) -> Result<()> {
        let source = self.path_for(location)?;
        fs::copy(&source, path).await.with_context(|| {
            format!("failed to copy {} to {}", source.display(), path.display())
        })?;
        Ok(())
    }

    async fn upload_from(
        &self,
        location: &BlobLocation,
        path: &Path,
        metadata: &BlobMetadata,
    ) -> Result<()> {
        let dest = self.path_for(location)?;
        Self::ensure_parent(&dest).await?;
        fs::copy(path, &dest).await.with_context(|| {
            format!("failed to copy {} to {}", path.display(), dest.display())
        })?;
        Self::write_metadata(&dest, metadata).await
    }
}

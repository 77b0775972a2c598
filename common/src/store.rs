use std::{path::PathBuf, sync::Arc};

use bytes::Bytes;
use fs_err as fs;
use futures::TryStreamExt;
use object_store::{
    aws::AmazonS3Builder, azure::MicrosoftAzureBuilder, gcp::GoogleCloudStorageBuilder,
    local::LocalFileSystem, path::Path, prefix::PrefixStore, ObjectMeta, ObjectStore,
    ObjectStoreScheme,
};
use url::Url;

use crate::BoxError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::ObjectStore(object_store::Error::NotFound { .. })
        )
    }
}

/// A wrapper around an `ObjectStore`. There are a few things it helps us with
/// over a plain `ObjectStore`:
/// - Keeps track of the URL of the store, in case we need it.
/// - Handles relative filesystem paths and path prefixes.
/// - Can be extended with helper functions.
#[derive(Debug, Clone)]
pub struct Store {
    url: Url,
    store: Arc<PrefixStore<Arc<dyn ObjectStore>>>,
}

impl Store {
    /// Creates a store for an object store url or filesystem directory.
    ///
    /// Examples of valid formats for `data_location`:
    /// - Filesystem path: `relative/path/to/data/`
    /// - GCS: `gs://bucket-name`
    /// - S3: `s3://bucket-name`
    /// - Prefixed: `s3://bucket-name/my_prefix/`
    ///
    /// If `data_location` is a relative filesystem path, then `base` will be
    /// used as the prefix.
    pub fn new(data_location: String, base: Option<&std::path::Path>) -> Result<Self, BoxError> {
        let url = infer_url(data_location, base)?;
        let unprefixed = infer_object_store(&url)?;
        let store = Arc::new(PrefixStore::new(unprefixed, url.path()));
        Ok(Self { url, store })
    }

    pub fn in_memory() -> Self {
        let url = Url::parse("memory://in_memory_store/").unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(object_store::memory::InMemory::new());
        Self {
            url,
            store: Arc::new(PrefixStore::new(store, "")),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn get_bytes(&self, location: impl Into<Path>) -> Result<Bytes, StoreError> {
        Ok(self.store.get(&location.into()).await?.bytes().await?)
    }

    pub async fn put_bytes(
        &self,
        location: impl Into<Path>,
        bytes: Bytes,
    ) -> Result<(), StoreError> {
        self.store.put(&location.into(), bytes.into()).await?;
        Ok(())
    }

    pub async fn delete(&self, location: impl Into<Path>) -> Result<(), StoreError> {
        self.store.delete(&location.into()).await?;
        Ok(())
    }

    /// Lists every object under `prefix`. The listing is unordered.
    pub async fn list(&self, prefix: impl Into<Path>) -> Result<Vec<ObjectMeta>, StoreError> {
        Ok(self.store.list(Some(&prefix.into())).try_collect().await?)
    }
}

impl std::fmt::Display for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "store at {}", self.url)
    }
}

fn infer_object_store(url: &Url) -> Result<Arc<dyn ObjectStore>, BoxError> {
    let (scheme, _) = ObjectStoreScheme::parse(url)?;

    match scheme {
        ObjectStoreScheme::GoogleCloudStorage => {
            let builder = GoogleCloudStorageBuilder::from_env().with_url(url.to_string());
            Ok(Arc::new(builder.build()?))
        }
        ObjectStoreScheme::AmazonS3 => {
            let builder = AmazonS3Builder::from_env().with_url(url.to_string());
            Ok(Arc::new(builder.build()?))
        }
        ObjectStoreScheme::MicrosoftAzure => {
            let builder = MicrosoftAzureBuilder::from_env().with_url(url.to_string());
            Ok(Arc::new(builder.build()?))
        }
        ObjectStoreScheme::Local => Ok(Arc::new(LocalFileSystem::new())),
        ObjectStoreScheme::Http => Err(format!(
            "unsupported object store url: {url}. For an S3-compatible store, use the \
             `s3://` scheme and configure AWS_ENDPOINT."
        )
        .into()),
        scheme => Err(format!("unsupported object store scheme: {scheme:?}").into()),
    }
}

fn infer_url(mut data_location: String, base: Option<&std::path::Path>) -> Result<Url, BoxError> {
    if !data_location.ends_with('/') {
        data_location.push('/');
    }
    let url = match Url::parse(&data_location) {
        Ok(url) => url,

        // If the location is not an URL, try to parse it as a filesystem path.
        Err(_) => {
            let mut path = PathBuf::from(&data_location);
            if !path.is_absolute() {
                if let Some(base) = base {
                    path = PathBuf::from(base).join(path);
                }
            }

            // Error if the directory does not exist.
            let path = fs::canonicalize(path)?;

            Url::from_directory_path(path).unwrap()
        }
    };
    Ok(url)
}

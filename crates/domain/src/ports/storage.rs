use async_trait::async_trait;
use vessel_errors::VesselResult;

/// Opaque blob storage addressed by bucket and path.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, bucket: &str, path: &str, data: Vec<u8>) -> VesselResult<()>;
    async fn get(&self, bucket: &str, path: &str) -> VesselResult<Option<Vec<u8>>>;
    async fn delete(&self, bucket: &str, path: &str) -> VesselResult<bool>;
    async fn list(&self, bucket: &str) -> VesselResult<Vec<String>>;
}

/// Read-only file access for one URI scheme.
#[async_trait]
pub trait FileSystem: Send + Sync {
    fn scheme(&self) -> &str;

    /// `location` is the part of the URI after `scheme://`.
    async fn read(&self, location: &str) -> VesselResult<Vec<u8>>;
}

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use vessel_domain::{FileSystem, ObjectStore};
use vessel_errors::{VesselError, VesselResult};

pub const FILE_SCHEME: &str = "file";
pub const OBJECT_SCHEME: &str = "obj";

/// Local disk, optionally confined to a root directory.
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem {
    root: Option<PathBuf>,
}

impl LocalFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, location: &str) -> VesselResult<PathBuf> {
        match &self.root {
            None => Ok(PathBuf::from(location)),
            Some(root) => {
                let relative = location.trim_start_matches('/');
                if relative.split('/').any(|part| part == "..") {
                    return Err(VesselError::execution(format!(
                        "path '{location}' escapes the filesystem root"
                    )));
                }
                Ok(root.join(relative))
            }
        }
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    fn scheme(&self) -> &str {
        FILE_SCHEME
    }

    async fn read(&self, location: &str) -> VesselResult<Vec<u8>> {
        let path = self.resolve(location)?;
        tokio::fs::read(&path).await.map_err(|e| {
            VesselError::execution(format!("failed to read '{}': {e}", path.display()))
        })
    }
}

/// Objects addressed as `<bucket>/<path>`.
#[derive(Clone)]
pub struct ObjectStoreFileSystem {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreFileSystem {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl FileSystem for ObjectStoreFileSystem {
    fn scheme(&self) -> &str {
        OBJECT_SCHEME
    }

    async fn read(&self, location: &str) -> VesselResult<Vec<u8>> {
        let (bucket, path) = location
            .trim_start_matches('/')
            .split_once('/')
            .filter(|(bucket, path)| !bucket.is_empty() && !path.is_empty())
            .ok_or_else(|| {
                VesselError::execution(format!(
                    "object location '{location}' must look like <bucket>/<path>"
                ))
            })?;
        self.store.get(bucket, path).await?.ok_or_else(|| {
            VesselError::execution(format!("object '{path}' not found in bucket '{bucket}'"))
        })
    }
}

/// Dispatches reads by URI scheme. A location without `scheme://` is a
/// local path.
#[derive(Clone, Default)]
pub struct FileSystemRegistry {
    filesystems: HashMap<String, Arc<dyn FileSystem>>,
}

impl FileSystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local files plus the given object store.
    pub fn standard(store: Arc<dyn ObjectStore>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LocalFileSystem::new()));
        registry.register(Arc::new(ObjectStoreFileSystem::new(store)));
        registry
    }

    pub fn register(&mut self, filesystem: Arc<dyn FileSystem>) -> &mut Self {
        self.filesystems
            .insert(filesystem.scheme().to_string(), filesystem);
        self
    }

    pub fn resolve<'a>(&self, uri: &'a str) -> VesselResult<(Arc<dyn FileSystem>, &'a str)> {
        let (scheme, location) = uri.split_once("://").unwrap_or((FILE_SCHEME, uri));
        let filesystem = self.filesystems.get(scheme).ok_or_else(|| {
            VesselError::execution(format!("no filesystem registered for scheme '{scheme}'"))
        })?;
        Ok((Arc::clone(filesystem), location))
    }
}

#[async_trait]
impl FileSystem for FileSystemRegistry {
    fn scheme(&self) -> &str {
        "vfs"
    }

    /// `location` is a full URI here.
    async fn read(&self, location: &str) -> VesselResult<Vec<u8>> {
        let (filesystem, inner) = self.resolve(location)?;
        debug!("Reading '{}' via {}://", inner, filesystem.scheme());
        filesystem.read(inner).await
    }
}

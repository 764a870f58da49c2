use std::io::Read;
use std::sync::Arc;

use arca_storage::Backend;
use arca_types::error::{ArcaError, Result};
use arca_types::{FileType, Handle, Id};

/// Read-only view over content-addressed objects, as needed by consumers
/// that only ever fetch blobs by id.
pub trait BlobLoader: Send + Sync {
    /// Size in bytes of the stored object for `id`.
    fn lookup_blob_size(&self, id: &Id) -> Result<u64>;

    /// Load the object `id` of `file_type` into `buf` and return it.
    ///
    /// `buf` is cleared first; its allocation is reused.
    fn load_blob(&self, file_type: FileType, id: &Id, buf: Vec<u8>) -> Result<Vec<u8>>;
}

/// [`BlobLoader`] reading straight from a backend.
#[derive(Clone)]
pub struct BackendBlobLoader {
    storage: Arc<dyn Backend>,
}

impl BackendBlobLoader {
    pub fn new(storage: Arc<dyn Backend>) -> Self {
        Self { storage }
    }
}

impl BlobLoader for BackendBlobLoader {
    fn lookup_blob_size(&self, id: &Id) -> Result<u64> {
        Ok(self.storage.stat(&Handle::from_id(FileType::Data, id))?.size)
    }

    fn load_blob(&self, file_type: FileType, id: &Id, mut buf: Vec<u8>) -> Result<Vec<u8>> {
        let handle = Handle::from_id(file_type, id);
        buf.clear();
        self.storage.load(&handle, 0, 0)?.read_to_end(&mut buf)?;
        let actual = Id::hash(&buf);
        if actual != *id {
            return Err(ArcaError::HashMismatch {
                handle,
                actual: actual.to_hex(),
            });
        }
        Ok(buf)
    }
}

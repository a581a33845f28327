//! Boundary to the blob/object-storage layer that downloads segment files and tracks which
//! files are in use. The readers only call through this trait.

use crate::error::Result;
use std::collections::HashMap;

pub trait BlobStore: std::fmt::Debug + Send + Sync + 'static {
    /// Makes `file_name` available locally, optionally marking it in use.
    fn download_segment_blob(&self, file_name: &str, mark_in_use: bool) -> Result<()>;

    /// Downloads many files at once. Keys are file names, values the column they hold.
    fn bulk_download_segment_blob(
        &self,
        files: &HashMap<String, String>,
        mark_in_use: bool,
    ) -> Result<()>;

    fn set_seg_set_files_as_not_in_use(&self, file_names: &[String]) -> Result<()>;

    fn set_blob_as_not_in_use(&self, file_name: &str) -> Result<()>;
}

/// Blob store for fully local deployments: every file is already on disk.
#[derive(Debug, Default)]
pub struct LocalBlobStore;

impl BlobStore for LocalBlobStore {
    fn download_segment_blob(&self, _file_name: &str, _mark_in_use: bool) -> Result<()> {
        Ok(())
    }

    fn bulk_download_segment_blob(
        &self,
        _files: &HashMap<String, String>,
        _mark_in_use: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn set_seg_set_files_as_not_in_use(&self, _file_names: &[String]) -> Result<()> {
        Ok(())
    }

    fn set_blob_as_not_in_use(&self, _file_name: &str) -> Result<()> {
        Ok(())
    }
}

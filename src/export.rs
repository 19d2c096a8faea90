use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::ExportError;
use crate::record::DocumentRecord;

/// Sink for records coming out of a crawl, called from a single task in arrival order.
pub trait ItemPipeline: Send {
    fn process_item(&mut self, item: DocumentRecord) -> Result<(), ExportError>;
}

impl ItemPipeline for Vec<DocumentRecord> {
    fn process_item(&mut self, item: DocumentRecord) -> Result<(), ExportError> {
        self.push(item);
        Ok(())
    }
}

/// Streams records into a single JSON array file.
///
/// The file is opened by [`JsonExporter::create`] and closed by
/// [`JsonExporter::finish`]. Every record is flushed as soon as it is written.
/// Dropping an unfinished exporter still closes the array, so whatever was
/// written before a failure remains valid JSON.
pub struct JsonExporter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    count: usize,
}

impl JsonExporter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, ExportError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source| ExportError::Open { path: path.clone(), source };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(open_err)?;
        }
        let file = File::create(&path).map_err(open_err)?;

        let mut exporter = JsonExporter {
            path,
            out: Some(BufWriter::new(file)),
            count: 0,
        };
        exporter.write_raw(b"[")?;
        info!("Exporting records to {}", exporter.path.display());
        Ok(exporter)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn export(&mut self, record: &DocumentRecord) -> Result<(), ExportError> {
        // Serialize first so a bad record never leaves half an object in the file.
        let json = serde_json::to_vec(record)?;
        let sep: &[u8] = if self.count == 0 { b"\n" } else { b",\n" };
        self.write_raw(sep)?;
        self.write_raw(&json)?;
        self.count += 1;
        debug!(n = self.count, "exported record");
        Ok(())
    }

    /// Close the JSON array and the file.
    pub fn finish(mut self) -> Result<usize, ExportError> {
        self.close()?;
        info!("Exported {} records to {}", self.count, self.path.display());
        Ok(self.count)
    }

    fn close(&mut self) -> Result<(), ExportError> {
        let Some(mut out) = self.out.take() else {
            return Ok(());
        };
        let tail: &[u8] = if self.count == 0 { b"]" } else { b"\n]" };
        out.write_all(tail)
            .and_then(|_| out.flush())
            .map_err(|source| ExportError::Write { path: self.path.clone(), source })
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ExportError> {
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };
        out.write_all(bytes)
            .and_then(|_| out.flush())
            .map_err(|source| ExportError::Write { path: self.path.clone(), source })
    }
}

impl ItemPipeline for JsonExporter {
    fn process_item(&mut self, item: DocumentRecord) -> Result<(), ExportError> {
        self.export(&item)
    }
}

impl Drop for JsonExporter {
    fn drop(&mut self) {
        if self.out.is_some() {
            if let Err(e) = self.close() {
                warn!("Could not close {}: {}", self.path.display(), e);
            }
        }
    }
}

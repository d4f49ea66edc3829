//! Parquet export of working sheets.
//!
//! All columns are Utf8 except `session_duration`, which is a nullable Int64
//! parsed from the sheet's text cell (empty means null).

use arrow::array::{ArrayRef, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use bytes::{BufMut, Bytes, BytesMut};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use snafu::prelude::*;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

use super::WorkingSheet;
use crate::config::{MB, ParquetCompression};
use crate::enrich::{COLUMNS, SESSION_DURATION_COLUMN};
use crate::error::{
    BatchSnafu, BufferInUseSnafu, BufferLockSnafu, FooterReadSnafu, ParquetError, ParquetSnafu,
    PipelineError, PipelineStorageSnafu, WriteSnafu, WriterCreateSnafu,
};
use crate::storage::StorageProviderRef;

/// A buffer with interior mutability for the ArrowWriter.
#[derive(Clone)]
struct SharedBuffer {
    buffer: Arc<Mutex<bytes::buf::Writer<BytesMut>>>,
}

impl SharedBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(BytesMut::with_capacity(capacity).writer())),
        }
    }

    fn into_inner(self) -> Result<BytesMut, ParquetError> {
        let mutex = Arc::into_inner(self.buffer).context(BufferInUseSnafu)?;
        let writer = mutex.into_inner().map_err(|_| BufferLockSnafu.build())?;
        Ok(writer.into_inner())
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut buffer = self.buffer.try_lock().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::WouldBlock, "buffer lock contention")
        })?;
        Write::write(&mut *buffer, buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Arrow schema of exported parts.
pub fn part_schema() -> SchemaRef {
    let fields: Vec<Field> = COLUMNS
        .iter()
        .enumerate()
        .map(|(index, name)| {
            if index == SESSION_DURATION_COLUMN {
                Field::new(*name, DataType::Int64, true)
            } else {
                Field::new(*name, DataType::Utf8, false)
            }
        })
        .collect();
    Arc::new(Schema::new(fields))
}

fn writer_properties(compression: ParquetCompression) -> WriterProperties {
    let codec = match compression {
        ParquetCompression::Uncompressed => Compression::UNCOMPRESSED,
        ParquetCompression::Snappy => Compression::SNAPPY,
        ParquetCompression::Gzip => Compression::GZIP(GzipLevel::default()),
        ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
        ParquetCompression::Lz4 => Compression::LZ4,
    };
    WriterProperties::builder().set_compression(codec).build()
}

/// Build a record batch from the sheet's data rows.
fn sheet_batch(sheet: &WorkingSheet, schema: &SchemaRef) -> Result<RecordBatch, ParquetError> {
    let columns: Vec<ArrayRef> = (0..sheet.columns())
        .map(|col| -> ArrayRef {
            if col == SESSION_DURATION_COLUMN {
                let values: Int64Array = sheet
                    .rows()
                    .iter()
                    .map(|row| row[col].trim().parse::<i64>().ok())
                    .collect();
                Arc::new(values)
            } else {
                let values: StringArray = sheet
                    .rows()
                    .iter()
                    .map(|row| Some(row[col].as_str()))
                    .collect();
                Arc::new(values)
            }
        })
        .collect();

    RecordBatch::try_new(schema.clone(), columns).context(BatchSnafu)
}

/// Encode a sheet as a complete Parquet file.
pub fn encode_sheet(
    sheet: &WorkingSheet,
    compression: ParquetCompression,
) -> Result<Bytes, ParquetError> {
    let schema = part_schema();
    let batch = sheet_batch(sheet, &schema)?;

    let buffer = SharedBuffer::new(MB);
    let mut writer = ArrowWriter::try_new(
        buffer.clone(),
        schema,
        Some(writer_properties(compression)),
    )
    .context(WriterCreateSnafu)?;
    writer.write(&batch).context(WriteSnafu)?;
    writer.close().context(WriteSnafu)?;

    Ok(buffer.into_inner()?.freeze())
}

/// Row count stored in a Parquet footer.
pub fn footer_rows(path: &str, bytes: Bytes) -> Result<usize, ParquetError> {
    let reader = SerializedFileReader::new(bytes).context(FooterReadSnafu { path })?;
    let rows = reader.metadata().file_metadata().num_rows();
    Ok(usize::try_from(rows).unwrap_or_default())
}

/// State of a part's output object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Missing,
    Present { rows: usize },
    Unreadable,
}

/// Writes exported parts to the sink location.
pub struct PartWriter {
    storage: StorageProviderRef,
    compression: ParquetCompression,
}

impl PartWriter {
    pub fn new(storage: StorageProviderRef, compression: ParquetCompression) -> Self {
        Self {
            storage,
            compression,
        }
    }

    /// Inspect an existing part without rewriting it.
    pub async fn inspect(&self, name: &str) -> Result<ArtifactState, PipelineError> {
        let bytes = match self.storage.get(name).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(ArtifactState::Missing),
            Err(e) => return Err(e).context(PipelineStorageSnafu),
        };

        match footer_rows(name, bytes) {
            Ok(rows) => Ok(ArtifactState::Present { rows }),
            Err(e) => {
                warn!(part = name, error = %e, "Existing part is unreadable, it will be rewritten");
                Ok(ArtifactState::Unreadable)
            }
        }
    }

    /// Export the sheet to `name`, returning the encoded size in bytes.
    pub async fn export(&self, sheet: &WorkingSheet, name: &str) -> Result<usize, PipelineError> {
        let start = Instant::now();
        let bytes = encode_sheet(sheet, self.compression).context(ParquetSnafu)?;
        let size = bytes.len();
        self.storage
            .put(name, bytes)
            .await
            .context(PipelineStorageSnafu)?;

        debug!(
            part = name,
            rows = sheet.row_count(),
            bytes = size,
            duration_ms = start.elapsed().as_millis() as u64,
            "Exported part"
        );
        Ok(size)
    }
}

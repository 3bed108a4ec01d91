use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use std::io::Cursor;

use crate::errors::{GridTxError, Result};

/// Encodes a `RecordBatch` into Arrow IPC stream bytes.
///
/// Transaction messages carry values in this form, so that the transport
/// collaborator only ever moves opaque byte buffers.
pub fn encode_batch(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut writer = StreamWriter::try_new(Vec::new(), &batch.schema())?;
    writer.write(batch)?;
    writer.finish()?;
    Ok(writer.into_inner()?)
}

/// Decodes a single `RecordBatch` from Arrow IPC stream bytes.
pub fn decode_batch(bytes: &[u8]) -> Result<RecordBatch> {
    let mut reader = StreamReader::try_new(Cursor::new(bytes), None)?;
    match reader.next() {
        Some(batch) => Ok(batch?),
        None => Err(GridTxError::ArrowError(
            "IPC stream contained no record batch".to_string(),
        )),
    }
}

/// Encodes an optional value, `None` standing for a delete.
pub fn encode_optional(batch: Option<&RecordBatch>) -> Result<Option<Vec<u8>>> {
    batch.map(encode_batch).transpose()
}

/// File-access record stream
///
/// One JSON object per line, `{"existed":bool,"path":string}`, in
/// observation order. The tracer inside a sandbox writes it; the engine
/// outside reads it back.
use crate::config::types::{DeptraceError, FileAccessRecord, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Incremental writer; each record is flushed so a killed tracer still
/// leaves every observed record on disk
pub struct RecordWriter<W: Write> {
    out: W,
    written: usize,
}

impl RecordWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path).map_err(|e| {
            DeptraceError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create record stream {}: {}", path.display(), e),
            ))
        })?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> RecordWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, written: 0 }
    }

    pub fn write(&mut self, record: &FileAccessRecord) -> Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Parse a whole stream. Blank lines are skipped; any other line that is
/// not a record fails with its 1-based line number.
pub fn read_records<R: Read>(input: R) -> Result<Vec<FileAccessRecord>> {
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(input).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record: FileAccessRecord =
            serde_json::from_str(trimmed).map_err(|e| DeptraceError::Stream {
                line: idx + 1,
                details: e.to_string(),
            })?;
        records.push(record);
    }
    Ok(records)
}

pub fn read_records_from_file(path: &Path) -> Result<Vec<FileAccessRecord>> {
    let file = File::open(path).map_err(|e| DeptraceError::Stream {
        line: 0,
        details: format!("cannot open {}: {}", path.display(), e),
    })?;
    read_records(file)
}

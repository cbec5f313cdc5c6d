//! Delimited text file source

use async_trait::async_trait;
use csv_async::{AsyncReader, AsyncReaderBuilder, ByteRecord, Position, StringRecord};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncSeekExt;

use super::{RawRecord, SourceCursor, SourceReader};
use crate::error::{IngestError, IngestResult};

fn default_delimiter() -> char {
    ','
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSourceConfig {
    pub path: PathBuf,
    /// Single ASCII field delimiter
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl FileSourceConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: default_delimiter(),
        }
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn delimiter_byte(&self) -> IngestResult<u8> {
        if self.delimiter.is_ascii() && self.delimiter != '\n' && self.delimiter != '\r' {
            Ok(self.delimiter as u8)
        } else {
            Err(IngestError::Config(format!(
                "delimiter {:?} must be a single ASCII character",
                self.delimiter
            )))
        }
    }
}

/// Reads a header line, then yields one record per following line
///
/// A line that is not valid UTF-8 is returned as [`RawRecord::Undecodable`]
/// so it can be rejected like any other bad row. Only read failures end the
/// sequence with an error.
pub struct DelimitedFileSource {
    reader: AsyncReader<File>,
    path: PathBuf,
    headers: Arc<[String]>,
    /// Absolute offset the reader was started at
    base_offset: u64,
    /// Line number of the reader's first record, unknown after a resume
    first_line: Option<u64>,
    /// Absolute offset just past the last record returned
    offset: u64,
    record: ByteRecord,
}

impl DelimitedFileSource {
    /// Open `config.path`, starting after the header or at `resume_offset`
    pub async fn open(config: &FileSourceConfig, resume_offset: Option<u64>) -> IngestResult<Self> {
        let delimiter = config.delimiter_byte()?;
        let (headers, data_start, first_data_line) = read_header(config, delimiter).await?;

        let start = resume_offset.map_or(data_start, |o| o.max(data_start));
        let mut file = open_file(config).await?;
        file.seek(SeekFrom::Start(start)).await.map_err(|e| {
            IngestError::Source(format!("cannot seek {} to {start}: {e}", config.path.display()))
        })?;

        tracing::debug!(
            path = %config.path.display(),
            columns = headers.len(),
            start_offset = start,
            "Opened delimited source"
        );

        Ok(Self {
            reader: builder(delimiter).create_reader(file),
            path: config.path.clone(),
            headers,
            base_offset: start,
            first_line: (start == data_start).then_some(first_data_line),
            offset: start,
            record: ByteRecord::new(),
        })
    }

    /// Human readable position of `at` within the whole file
    fn location(&self, at: &Position) -> String {
        let byte = self.base_offset + at.byte();
        match self.first_line {
            Some(first) => format!("line {}, byte {byte}", first + at.line().saturating_sub(1)),
            None => format!("byte {byte}"),
        }
    }

    fn read_error(&self, at: &Position, err: csv_async::Error) -> IngestError {
        let detail = match err.kind() {
            csv_async::ErrorKind::Io(e) => e.to_string(),
            _ => err.to_string(),
        };
        IngestError::Source(format!(
            "cannot read {} at {}: {detail}",
            self.path.display(),
            self.location(at)
        ))
    }

    fn decode(&self, at: &Position) -> RawRecord {
        let mut values = Vec::with_capacity(self.record.len());
        let mut bad_field = None;
        for (i, field) in self.record.iter().enumerate() {
            match std::str::from_utf8(field) {
                Ok(text) => values.push(text.to_string()),
                Err(_) => {
                    bad_field = bad_field.or(Some(i + 1));
                    values.push(String::from_utf8_lossy(field).into_owned());
                },
            }
        }

        match bad_field {
            None => RawRecord::Delimited {
                headers: Arc::clone(&self.headers),
                values,
            },
            Some(field) => RawRecord::Undecodable {
                values,
                reason: format!("field {field} at {} is not valid UTF-8", self.location(at)),
            },
        }
    }
}

fn builder(delimiter: u8) -> AsyncReaderBuilder {
    let mut builder = AsyncReaderBuilder::new();
    // Arity is checked per row by the transformer, not by the parser
    builder.delimiter(delimiter).has_headers(false).flexible(true);
    builder
}

async fn open_file(config: &FileSourceConfig) -> IngestResult<File> {
    File::open(&config.path)
        .await
        .map_err(|e| IngestError::Source(format!("cannot open {}: {e}", config.path.display())))
}

/// Header names, then the byte offset and line number of the first data line
async fn read_header(
    config: &FileSourceConfig,
    delimiter: u8,
) -> IngestResult<(Arc<[String]>, u64, u64)> {
    let file = open_file(config).await?;
    let mut reader = builder(delimiter).create_reader(file);
    let mut header = StringRecord::new();

    let found = reader.read_record(&mut header).await.map_err(|e| {
        IngestError::Source(format!("cannot read header of {}: {e}", config.path.display()))
    })?;
    if !found {
        return Err(IngestError::Source(format!(
            "{} is empty, expected a header line",
            config.path.display()
        )));
    }

    let names: Vec<String> = header.iter().map(|h| h.trim().to_string()).collect();
    let next = reader.position();
    Ok((Arc::from(names), next.byte(), next.line()))
}

#[async_trait]
impl SourceReader for DelimitedFileSource {
    async fn next_record(&mut self) -> IngestResult<Option<RawRecord>> {
        let start = self.reader.position().clone();
        match self.reader.read_byte_record(&mut self.record).await {
            Ok(true) => {},
            Ok(false) => return Ok(None),
            Err(err) => return Err(self.read_error(&start, err)),
        }
        self.offset = self.base_offset + self.reader.position().byte();

        Ok(Some(self.decode(&start)))
    }

    fn cursor(&self) -> SourceCursor {
        SourceCursor::ByteOffset {
            offset: self.offset,
        }
    }

    fn headers(&self) -> Option<Arc<[String]>> {
        Some(Arc::clone(&self.headers))
    }
}

use {
  memmap2::MmapMut,
  std::{
    env,
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    process,
    sync::{Arc, Mutex, MutexGuard},
    time::{SystemTime, UNIX_EPOCH},
  },
};

use crate::records::{
  FORMAT_VERSION, HeaderMetadata, HeaderRecord, MAGIC, Record, StreamError,
};

/// Byte-stream destination behind the record writer.
///
/// Each `write_all` call carries exactly one framed record (or one header),
/// so sinks never need to reassemble frames.
pub trait RecordSink: Send {
  /// # Errors
  ///
  /// Returns an error if the sink cannot accept the full buffer.
  fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

  /// # Errors
  ///
  /// Returns an error if buffered data cannot be persisted.
  fn flush(&mut self) -> io::Result<()>;

  /// Reopen this sink for a forked child process, if the sink supports it.
  fn clone_in_child(&self) -> Option<Box<dyn RecordSink>>;
}

/// File-backed sink. The child-process clone reopens the same path with the
/// child's pid appended, so parent and child never interleave records.
pub struct FileSink {
  path: PathBuf,
  file: BufWriter<File>,
}

impl FileSink {
  /// # Errors
  ///
  /// Returns an error if the file cannot be created.
  pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
    let path = path.as_ref().to_path_buf();
    let file = File::create(&path)?;

    Ok(Self {
      path,
      file: BufWriter::new(file),
    })
  }
}

impl RecordSink for FileSink {
  fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
    self.file.write_all(buf)
  }

  fn flush(&mut self) -> io::Result<()> {
    self.file.flush()
  }

  fn clone_in_child(&self) -> Option<Box<dyn RecordSink>> {
    let mut path = self.path.clone().into_os_string();
    path.push(format!(".{}", process::id()));

    FileSink::create(path)
      .ok()
      .map(|sink| Box::new(sink) as Box<dyn RecordSink>)
  }
}

/// Sink backed by a fixed-capacity memory-mapped file.
pub struct MmapSink {
  mmap: MmapMut,
  position: usize,
}

impl MmapSink {
  /// # Errors
  ///
  /// Returns an error if the backing file cannot be created, resized, or
  /// mapped into memory.
  pub fn create(path: impl AsRef<Path>, capacity: usize) -> io::Result<Self> {
    let capacity = capacity.max(1);

    let file = OpenOptions::new()
      .create(true)
      .write(true)
      .read(true)
      .truncate(true)
      .open(path)?;

    let capacity_u64 = u64::try_from(capacity)
      .map_err(|_| io::Error::other("capacity exceeds u64"))?;

    file.set_len(capacity_u64)?;

    // SAFETY: the file handle remains open for the lifetime of the mapping.
    let mmap = unsafe { MmapMut::map_mut(&file)? };

    Ok(Self { mmap, position: 0 })
  }
}

impl RecordSink for MmapSink {
  fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
    let Some(end) = self.position.checked_add(buf.len()) else {
      return Err(io::Error::other("mmap position overflow"));
    };

    if end > self.mmap.len() {
      return Err(io::Error::new(
        io::ErrorKind::WriteZero,
        "mmap capacity exceeded",
      ));
    }

    self.mmap[self.position..end].copy_from_slice(buf);

    self.position = end;

    Ok(())
  }

  fn flush(&mut self) -> io::Result<()> {
    self.mmap.flush_async()
  }

  fn clone_in_child(&self) -> Option<Box<dyn RecordSink>> {
    // A shared mapping cannot be split between two processes.
    None
  }
}

/// In-memory sink collecting the stream into a shared buffer. The buffer
/// handle stays readable after the writer is dropped, which makes this the
/// natural sink for inspecting a finished capture in-process.
#[derive(Default)]
pub struct BufferSink {
  buffer: Arc<Mutex<Vec<u8>>>,
}

impl BufferSink {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Shared handle to the collected bytes.
  #[must_use]
  pub fn buffer(&self) -> Arc<Mutex<Vec<u8>>> {
    Arc::clone(&self.buffer)
  }
}

impl RecordSink for BufferSink {
  fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
    match self.buffer.lock() {
      Ok(mut guard) => guard.extend_from_slice(buf),
      Err(err) => err.into_inner().extend_from_slice(buf),
    }

    Ok(())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }

  fn clone_in_child(&self) -> Option<Box<dyn RecordSink>> {
    Some(Box::new(Self {
      buffer: Arc::clone(&self.buffer),
    }))
  }
}

/// Serializes records onto a sink behind an internal exclusive lock.
pub struct RecordWriter {
  metadata: HeaderMetadata,
  sink: Mutex<Box<dyn RecordSink>>,
}

impl RecordWriter {
  /// Wrap a sink, deriving header metadata from the current process.
  #[must_use]
  pub fn new(sink: Box<dyn RecordSink>, native_traces: bool) -> Self {
    let command_line = env::args().collect::<Vec<_>>().join(" ");

    let start_time_ms = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|elapsed| elapsed.as_millis() as u64)
      .unwrap_or(0);

    Self::with_metadata(
      sink,
      HeaderMetadata {
        pid: process::id(),
        command_line,
        start_time_ms,
        native_traces,
      },
    )
  }

  #[must_use]
  pub fn with_metadata(
    sink: Box<dyn RecordSink>,
    metadata: HeaderMetadata,
  ) -> Self {
    Self {
      metadata,
      sink: Mutex::new(sink),
    }
  }

  /// Reopen the underlying sink for a forked child, carrying the metadata
  /// over with the pid refreshed.
  #[must_use]
  pub fn clone_in_child(&self) -> Option<Self> {
    let sink = self.lock_sink().clone_in_child()?;

    let metadata = HeaderMetadata {
      pid: process::id(),
      ..self.metadata.clone()
    };

    Some(Self::with_metadata(sink, metadata))
  }

  /// # Errors
  ///
  /// Returns an error if buffered records cannot be persisted.
  pub fn flush(&self) -> Result<(), StreamError> {
    self.lock_sink().flush()?;
    Ok(())
  }

  /// Hold the sink lock across a run of records so they stay contiguous.
  #[must_use]
  pub fn lock(&self) -> ExclusiveWriter<'_> {
    ExclusiveWriter {
      sink: self.lock_sink(),
    }
  }

  fn lock_sink(&self) -> MutexGuard<'_, Box<dyn RecordSink>> {
    match self.sink.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  /// # Errors
  ///
  /// Returns an error if the header cannot be encoded or written.
  pub fn write_header(&self, terminal: bool) -> Result<(), StreamError> {
    let metadata_json = serde_json::to_string(&self.metadata)?;

    self.write_record(&Record::Header(HeaderRecord {
      magic: MAGIC.to_string(),
      version: FORMAT_VERSION,
      terminal,
      metadata_json,
    }))
  }

  /// # Errors
  ///
  /// Returns an error if the record cannot be encoded or written.
  pub fn write_record(&self, record: &Record) -> Result<(), StreamError> {
    let frame = encode_frame(record)?;
    self.lock_sink().write_all(&frame)?;
    Ok(())
  }
}

/// Guard returned by [`RecordWriter::lock`].
pub struct ExclusiveWriter<'a> {
  sink: MutexGuard<'a, Box<dyn RecordSink>>,
}

impl ExclusiveWriter<'_> {
  /// # Errors
  ///
  /// Returns an error if the record cannot be encoded or written.
  pub fn write_record(&mut self, record: &Record) -> Result<(), StreamError> {
    let frame = encode_frame(record)?;
    self.sink.write_all(&frame)?;
    Ok(())
  }
}

fn encode_frame(record: &Record) -> Result<Vec<u8>, StreamError> {
  let mut buf = Vec::with_capacity(64);
  record.encode(&mut buf)?;
  Ok(buf)
}

use {
  prost::bytes::Buf,
  serde::{Deserialize, Serialize},
  std::{
    fmt::{self, Display, Formatter},
    io,
  },
};

/// Magic string identifying a capture stream.
pub const MAGIC: &str = "memtrace";

/// Version of the wire format, bumped on incompatible layout changes.
pub const FORMAT_VERSION: u32 = 1;

/// Identifier of an interned `(function, file, parent_lineno)` triple.
pub type FrameId = u32;

/// Errors produced while encoding, writing, or reading a capture stream.
#[derive(Debug)]
pub enum StreamError {
  Decode(prost::DecodeError),
  Encode(prost::EncodeError),
  Io(io::Error),
  Json(serde_json::Error),
  UnknownRecord(u8),
}

impl Display for StreamError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Decode(err) => write!(f, "failed to decode record: {err}"),
      Self::Encode(err) => write!(f, "failed to encode record: {err}"),
      Self::Io(err) => write!(f, "i/o error on capture stream: {err}"),
      Self::Json(err) => write!(f, "failed to encode header metadata: {err}"),
      Self::UnknownRecord(kind) => {
        write!(f, "unknown record kind {kind} in capture stream")
      }
    }
  }
}

impl std::error::Error for StreamError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Decode(err) => Some(err),
      Self::Encode(err) => Some(err),
      Self::Io(err) => Some(err),
      Self::Json(err) => Some(err),
      Self::UnknownRecord(_) => None,
    }
  }
}

impl From<io::Error> for StreamError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

impl From<prost::EncodeError> for StreamError {
  fn from(value: prost::EncodeError) -> Self {
    Self::Encode(value)
  }
}

impl From<prost::DecodeError> for StreamError {
  fn from(value: prost::DecodeError) -> Self {
    Self::Decode(value)
  }
}

impl From<serde_json::Error> for StreamError {
  fn from(value: serde_json::Error) -> Self {
    Self::Json(value)
  }
}

/// One-byte discriminant preceding every length-delimited record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
  Header = 1,
  Allocation = 2,
  FrameIndex = 3,
  FramePush = 4,
  FramePop = 5,
  NativeTraceIndex = 6,
  MemoryMapStart = 7,
  SegmentHeader = 8,
  Segment = 9,
  MemoryRecord = 10,
  ThreadRecord = 11,
}

impl RecordType {
  fn from_u8(value: u8) -> Option<Self> {
    match value {
      1 => Some(Self::Header),
      2 => Some(Self::Allocation),
      3 => Some(Self::FrameIndex),
      4 => Some(Self::FramePush),
      5 => Some(Self::FramePop),
      6 => Some(Self::NativeTraceIndex),
      7 => Some(Self::MemoryMapStart),
      8 => Some(Self::SegmentHeader),
      9 => Some(Self::Segment),
      10 => Some(Self::MemoryRecord),
      11 => Some(Self::ThreadRecord),
      _ => None,
    }
  }
}

/// Which interposed entry point produced an allocation event.
#[derive(
  Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration,
)]
#[repr(i32)]
pub enum AllocatorKind {
  Malloc = 0,
  Free = 1,
  Calloc = 2,
  Realloc = 3,
  PosixMemalign = 4,
  AlignedAlloc = 5,
  Memalign = 6,
  Valloc = 7,
  Pvalloc = 8,
  Mmap = 9,
  Munmap = 10,
  PyMalloc = 11,
  PyFree = 12,
  PyCalloc = 13,
  PyRealloc = 14,
}

impl AllocatorKind {
  /// Whether this entry point releases memory rather than acquiring it.
  #[must_use]
  pub fn is_deallocation(self) -> bool {
    matches!(self, Self::Free | Self::Munmap | Self::PyFree)
  }
}

/// Process-level metadata carried by the header record as a JSON blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderMetadata {
  pub pid: u32,
  pub command_line: String,
  pub start_time_ms: u64,
  pub native_traces: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HeaderRecord {
  #[prost(string, tag = "1")]
  pub magic: String,
  #[prost(uint32, tag = "2")]
  pub version: u32,
  #[prost(bool, tag = "3")]
  pub terminal: bool,
  #[prost(string, tag = "4")]
  pub metadata_json: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AllocationRecord {
  #[prost(uint64, tag = "1")]
  pub thread_id: u64,
  #[prost(uint64, tag = "2")]
  pub address: u64,
  #[prost(uint64, tag = "3")]
  pub size: u64,
  #[prost(enumeration = "AllocatorKind", tag = "4")]
  pub allocator: i32,
  #[prost(uint32, tag = "5")]
  pub lineno: u32,
  #[prost(uint32, tag = "6")]
  pub native_index: u32,
}

/// Binds a freshly assigned frame id to its raw frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FrameIndexRecord {
  #[prost(uint32, tag = "1")]
  pub frame_id: FrameId,
  #[prost(string, tag = "2")]
  pub function: String,
  #[prost(string, tag = "3")]
  pub filename: String,
  #[prost(uint32, tag = "4")]
  pub parent_lineno: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FramePushRecord {
  #[prost(uint64, tag = "1")]
  pub thread_id: u64,
  #[prost(uint32, tag = "2")]
  pub frame_id: FrameId,
}

/// A coalesced run of pops; `count` never exceeds 255 in a single record.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FramePopRecord {
  #[prost(uint64, tag = "1")]
  pub thread_id: u64,
  #[prost(uint32, tag = "2")]
  pub count: u32,
}

/// A newly interned native trace node. The node's index is implied by arrival
/// order: the n-th record of this kind in the stream describes node n + 1.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NativeFrameRecord {
  #[prost(uint64, tag = "1")]
  pub ip: u64,
  #[prost(uint32, tag = "2")]
  pub parent_index: u32,
}

/// Marks the start of a fresh module-map snapshot, invalidating prior ones.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MemoryMapStartRecord {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SegmentHeaderRecord {
  #[prost(string, tag = "1")]
  pub filename: String,
  #[prost(uint32, tag = "2")]
  pub num_segments: u32,
  #[prost(uint64, tag = "3")]
  pub load_bias: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SegmentRecord {
  #[prost(uint64, tag = "1")]
  pub vaddr: u64,
  #[prost(uint64, tag = "2")]
  pub memsz: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MemoryRecord {
  #[prost(uint64, tag = "1")]
  pub time_ms: u64,
  #[prost(uint64, tag = "2")]
  pub rss_bytes: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ThreadRecord {
  #[prost(uint64, tag = "1")]
  pub thread_id: u64,
  #[prost(string, tag = "2")]
  pub name: String,
}

/// A single decoded or to-be-encoded capture record.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
  Header(HeaderRecord),
  Allocation(AllocationRecord),
  FrameIndex(FrameIndexRecord),
  FramePush(FramePushRecord),
  FramePop(FramePopRecord),
  NativeTraceIndex(NativeFrameRecord),
  MemoryMapStart,
  SegmentHeader(SegmentHeaderRecord),
  Segment(SegmentRecord),
  Memory(MemoryRecord),
  Thread(ThreadRecord),
}

impl Record {
  #[must_use]
  pub fn record_type(&self) -> RecordType {
    match self {
      Self::Header(_) => RecordType::Header,
      Self::Allocation(_) => RecordType::Allocation,
      Self::FrameIndex(_) => RecordType::FrameIndex,
      Self::FramePush(_) => RecordType::FramePush,
      Self::FramePop(_) => RecordType::FramePop,
      Self::NativeTraceIndex(_) => RecordType::NativeTraceIndex,
      Self::MemoryMapStart => RecordType::MemoryMapStart,
      Self::SegmentHeader(_) => RecordType::SegmentHeader,
      Self::Segment(_) => RecordType::Segment,
      Self::Memory(_) => RecordType::MemoryRecord,
      Self::Thread(_) => RecordType::ThreadRecord,
    }
  }

  /// Append the kind byte and the length-delimited payload to `buf`.
  ///
  /// # Errors
  ///
  /// Returns an error if the payload cannot be encoded.
  pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), StreamError> {
    use prost::Message;

    buf.push(self.record_type() as u8);

    match self {
      Self::Header(msg) => msg.encode_length_delimited(buf)?,
      Self::Allocation(msg) => msg.encode_length_delimited(buf)?,
      Self::FrameIndex(msg) => msg.encode_length_delimited(buf)?,
      Self::FramePush(msg) => msg.encode_length_delimited(buf)?,
      Self::FramePop(msg) => msg.encode_length_delimited(buf)?,
      Self::NativeTraceIndex(msg) => msg.encode_length_delimited(buf)?,
      Self::MemoryMapStart => {
        MemoryMapStartRecord {}.encode_length_delimited(buf)?;
      }
      Self::SegmentHeader(msg) => msg.encode_length_delimited(buf)?,
      Self::Segment(msg) => msg.encode_length_delimited(buf)?,
      Self::Memory(msg) => msg.encode_length_delimited(buf)?,
      Self::Thread(msg) => msg.encode_length_delimited(buf)?,
    }

    Ok(())
  }
}

/// Decode an entire capture stream back into typed records.
///
/// # Errors
///
/// Returns an error if a record kind is unknown or a payload is malformed.
pub fn decode_stream(bytes: &[u8]) -> Result<Vec<Record>, StreamError> {
  use prost::Message;

  let mut buf = bytes;
  let mut records = Vec::new();

  while buf.has_remaining() {
    let kind = buf.get_u8();

    let Some(kind) = RecordType::from_u8(kind) else {
      return Err(StreamError::UnknownRecord(kind));
    };

    let record = match kind {
      RecordType::Header => {
        Record::Header(HeaderRecord::decode_length_delimited(&mut buf)?)
      }
      RecordType::Allocation => {
        Record::Allocation(AllocationRecord::decode_length_delimited(&mut buf)?)
      }
      RecordType::FrameIndex => Record::FrameIndex(
        FrameIndexRecord::decode_length_delimited(&mut buf)?,
      ),
      RecordType::FramePush => {
        Record::FramePush(FramePushRecord::decode_length_delimited(&mut buf)?)
      }
      RecordType::FramePop => {
        Record::FramePop(FramePopRecord::decode_length_delimited(&mut buf)?)
      }
      RecordType::NativeTraceIndex => Record::NativeTraceIndex(
        NativeFrameRecord::decode_length_delimited(&mut buf)?,
      ),
      RecordType::MemoryMapStart => {
        MemoryMapStartRecord::decode_length_delimited(&mut buf)?;
        Record::MemoryMapStart
      }
      RecordType::SegmentHeader => Record::SegmentHeader(
        SegmentHeaderRecord::decode_length_delimited(&mut buf)?,
      ),
      RecordType::Segment => {
        Record::Segment(SegmentRecord::decode_length_delimited(&mut buf)?)
      }
      RecordType::MemoryRecord => {
        Record::Memory(MemoryRecord::decode_length_delimited(&mut buf)?)
      }
      RecordType::ThreadRecord => {
        Record::Thread(ThreadRecord::decode_length_delimited(&mut buf)?)
      }
    };

    records.push(record);
  }

  Ok(records)
}

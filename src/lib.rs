//! Core of a streaming memory profiler for a high-level interpreted
//! language.
//!
//! Every intercepted heap allocation and deallocation is correlated with the
//! host-language call stack (and optionally the native call stack) and
//! appended to a length-framed binary capture stream for offline analysis.
//! The crate is host-agnostic: an FFI bridge feeds it allocator events and
//! call/return notifications, passing host frames as opaque handles.

mod config;
mod frames;
mod guard;
mod host;
mod modules;
mod native;
mod python_stack;
mod records;
mod sampler;
mod tracker;
mod writer;

pub use {
  config::TrackerConfig,
  frames::{FrameRegistry, RawFrame},
  guard::RecursionGuard,
  host::{FrameHandle, ProfileEvent, on_profile_event, reset_thread_tracking},
  native::{MAX_NATIVE_FRAMES, NativeTrace, TraceTree},
  records::{
    AllocationRecord, AllocatorKind, FORMAT_VERSION, FrameId,
    FrameIndexRecord, FramePopRecord, FramePushRecord, HeaderMetadata,
    HeaderRecord, MAGIC, MemoryRecord, NativeFrameRecord, Record, RecordType,
    SegmentHeaderRecord, SegmentRecord, StreamError, ThreadRecord,
    decode_stream,
  },
  tracker::Tracker,
  writer::{
    BufferSink, ExclusiveWriter, FileSink, MmapSink, RecordSink, RecordWriter,
  },
};

use {
  dashmap::DashMap,
  std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
  },
};

use crate::records::{FrameId, FrameIndexRecord, Record, StreamError};
use crate::writer::RecordWriter;

/// A host-language call site: who was called, from which file, and the line
/// in the caller where the call occurred.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawFrame {
  pub function: Arc<str>,
  pub filename: Arc<str>,
  pub parent_lineno: u32,
}

impl RawFrame {
  #[must_use]
  pub fn new(
    function: impl Into<Arc<str>>,
    filename: impl Into<Arc<str>>,
    parent_lineno: u32,
  ) -> Self {
    Self {
      function: function.into(),
      filename: filename.into(),
      parent_lineno,
    }
  }
}

/// Interns raw frames to compact ids, emitting a `FRAME_INDEX` record the
/// first time each frame is seen. Ids are stable for the process lifetime;
/// id 0 is reserved to mean "no frame".
#[derive(Debug, Default)]
pub struct FrameRegistry {
  frames: DashMap<RawFrame, FrameId>,
  next_id: AtomicU32,
}

impl FrameRegistry {
  #[must_use]
  pub fn new() -> Self {
    Self {
      frames: DashMap::new(),
      next_id: AtomicU32::new(1),
    }
  }

  /// Insert-or-get the id for `frame`. The binding record is written inside
  /// the insertion slot, so the insert+emit pair is serialised per frame and
  /// exactly one `FRAME_INDEX` is emitted per distinct raw frame.
  ///
  /// # Errors
  ///
  /// Returns an error if the frame was new and its binding record could not
  /// be written. The id assignment itself never fails.
  pub fn get_or_register(
    &self,
    frame: &RawFrame,
    writer: &RecordWriter,
  ) -> Result<FrameId, StreamError> {
    if let Some(existing) = self.frames.get(frame) {
      return Ok(*existing);
    }

    let mut write_result = Ok(());

    let id = *self.frames.entry(frame.clone()).or_insert_with(|| {
      let id = self.next_id.fetch_add(1, Ordering::Relaxed);

      write_result =
        writer.write_record(&Record::FrameIndex(FrameIndexRecord {
          frame_id: id,
          function: frame.function.to_string(),
          filename: frame.filename.to_string(),
          parent_lineno: frame.parent_lineno,
        }));

      id
    });

    write_result.map(|()| id)
  }
}

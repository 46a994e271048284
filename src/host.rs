use crate::guard::RecursionGuard;
use crate::frames::RawFrame;
use crate::python_stack;
use crate::tracker::Tracker;

/// Opaque reference to a host interpreter frame.
///
/// Carries the raw address of the host's frame object together with a
/// monomorphic accessor for its currently executing line, so the core never
/// needs to know the host's frame layout. Handles are only held between a
/// call event and its matching return, mirroring the host's own guarantee
/// of frame validity.
#[derive(Clone, Copy, Debug)]
pub struct FrameHandle {
  raw: usize,
  line: fn(usize) -> u32,
}

impl FrameHandle {
  #[must_use]
  pub fn new(raw: usize, line: fn(usize) -> u32) -> Self {
    Self { raw, line }
  }

  /// The line currently executing in the referenced frame.
  #[must_use]
  pub fn line_number(&self) -> u32 {
    (self.line)(self.raw)
  }

  #[must_use]
  pub fn raw(&self) -> usize {
    self.raw
  }
}

/// A call/return notification from the host interpreter's profile hook.
///
/// `Call` carries the function and file names decoded from the host frame;
/// `None` means the host string could not be decoded.
#[derive(Debug, Clone, Copy)]
pub enum ProfileEvent<'a> {
  Call {
    function: Option<&'a str>,
    filename: Option<&'a str>,
  },
  Return,
  Other,
}

/// Entry point for the host's per-thread profile hook.
///
/// Returns 0 on success and -1 on a host-decode failure, matching the
/// convention by which the host disables tracing on the failing thread.
pub fn on_profile_event(frame: FrameHandle, event: ProfileEvent<'_>) -> i32 {
  let _guard = RecursionGuard::acquire();

  if !Tracker::is_active() {
    return 0;
  }

  match event {
    ProfileEvent::Call { function, filename } => {
      let Some(function) = function else {
        return -1;
      };

      let Some(filename) = filename else {
        return -1;
      };

      let parent_lineno = python_stack::current_line();

      python_stack::push_frame(
        frame,
        RawFrame::new(function, filename, parent_lineno),
      );

      0
    }
    ProfileEvent::Return => {
      python_stack::pop_frame();
      0
    }
    ProfileEvent::Other => 0,
  }
}

/// Seed (or clear) the calling thread's tracking state.
///
/// The bridge calls this with the currently executing host frame right after
/// registering its profile hook on a thread, and with `None` on teardown.
/// Bridges must keep installation idempotent per thread: when the host
/// already reports the hook as installed, do not call this again, or line
/// attribution for frames below the entry point would be lost.
pub fn reset_thread_tracking(entry_frame: Option<FrameHandle>) {
  let _guard = RecursionGuard::acquire();
  python_stack::reset(entry_frame);
}

#[cfg(test)]
mod tests {
  use super::*;

  fn fixed_line(raw: usize) -> u32 {
    raw as u32
  }

  #[test]
  fn handle_reads_line_through_accessor() {
    let handle = FrameHandle::new(17, fixed_line);
    assert_eq!(handle.line_number(), 17);
    assert_eq!(handle.raw(), 17);
  }
}

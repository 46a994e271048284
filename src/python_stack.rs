//! Per-thread shadow of the host-language call stack.
//!
//! Pushes are recorded lazily: a frame only becomes a `FRAME_PUSH` record
//! when an allocation makes it observable, and runs of pops of already
//! emitted frames are coalesced into a pending counter that is drained on
//! the next event. Most host call/return pairs contain no allocation, so
//! this collapses the per-event overhead when the host churns its stack
//! between allocation points.

use std::cell::{Cell, RefCell};

use crate::frames::RawFrame;
use crate::host::FrameHandle;
use crate::tracker::Tracker;

struct LazilyEmittedFrame {
  frame: FrameHandle,
  raw_frame: RawFrame,
  emitted: bool,
}

const INITIAL_STACK_FRAMES: usize = 1024;

thread_local! {
  // Trivially destructible pieces: plain cells with no destructor, so they
  // stay accessible while the thread tears down.
  static PENDING_POPS: Cell<u32> = const { Cell::new(0) };
  static ENTRY_FRAME: Cell<Option<FrameHandle>> = const { Cell::new(None) };

  // The shadow-stack container. `None` until the first push, and only
  // `push_frame` may create it. During thread teardown the allocator can
  // call back into the tracker after this slot's destructor has run;
  // `try_with` then fails and every operation behaves as if the stack were
  // empty, so nothing can resurrect the container.
  static SHADOW_STACK: RefCell<Option<Vec<LazilyEmittedFrame>>> =
    const { RefCell::new(None) };
}

/// Clear the shadow stack (when it exists) and set the entry frame: the host
/// frame that was executing when tracing was installed on this thread.
pub(crate) fn reset(entry_frame: Option<FrameHandle>) {
  let _ = ENTRY_FRAME.try_with(|cell| cell.set(entry_frame));

  let _ = SHADOW_STACK.try_with(|stack| {
    if let Some(frames) = stack.borrow_mut().as_mut() {
      frames.clear();
    }
  });
}

/// Append an unemitted frame. This is the only operation that creates the
/// shadow-stack container.
pub(crate) fn push_frame(frame: FrameHandle, raw_frame: RawFrame) {
  let _ = SHADOW_STACK.try_with(|stack| {
    stack
      .borrow_mut()
      .get_or_insert_with(|| Vec::with_capacity(INITIAL_STACK_FRAMES))
      .push(LazilyEmittedFrame {
        frame,
        raw_frame,
        emitted: false,
      });
  });
}

/// Pop the shadow-stack top, deferring the pop record if the frame had been
/// emitted. Popping an empty stack means we are unwinding above the point
/// where tracing began, so the entry frame is cleared instead.
pub(crate) fn pop_frame() {
  let popped = SHADOW_STACK
    .try_with(|stack| {
      let mut stack = stack.borrow_mut();
      let frames = stack.as_mut()?;
      let top = frames.pop()?;
      Some((top.emitted, frames.is_empty()))
    })
    .ok()
    .flatten();

  let Some((emitted, now_empty)) = popped else {
    let _ = ENTRY_FRAME.try_with(|cell| cell.set(None));
    return;
  };

  if emitted {
    let _ =
      PENDING_POPS.try_with(|cell| cell.set(cell.get().saturating_add(1)));
  }

  if now_empty {
    // Every frame we pushed has been popped. The thread may be exiting, so
    // drain the counter now in case no allocation gives us another chance.
    flush_pending_pops();
  }
}

/// Source line of the top shadow frame, else of the entry frame, else 0.
pub(crate) fn current_line() -> u32 {
  let top = SHADOW_STACK
    .try_with(|stack| {
      stack
        .borrow()
        .as_ref()
        .and_then(|frames| frames.last().map(|entry| entry.frame))
    })
    .ok()
    .flatten();

  match top {
    Some(frame) => frame.line_number(),
    None => ENTRY_FRAME
      .try_with(Cell::get)
      .ok()
      .flatten()
      .map_or(0, |frame| frame.line_number()),
  }
}

/// Write a run of pop records totalling the pending counter and zero it.
pub(crate) fn flush_pending_pops() {
  let count = PENDING_POPS.try_with(|cell| cell.replace(0)).unwrap_or(0);

  if count == 0 {
    return;
  }

  if let Some(tracker) = Tracker::get() {
    tracker.pop_frames(count);
  }
}

/// Emit a push record for every frame above the topmost already-emitted one.
/// If a write fails the remaining frames stay unemitted and are retried on
/// the next event.
pub(crate) fn flush_pending_pushes() {
  let Some(tracker) = Tracker::get() else {
    return;
  };

  let _ = SHADOW_STACK.try_with(|stack| {
    let mut stack = stack.borrow_mut();

    let Some(frames) = stack.as_mut() else {
      return;
    };

    let first_unemitted = frames
      .iter()
      .rposition(|entry| entry.emitted)
      .map_or(0, |index| index + 1);

    for entry in &mut frames[first_unemitted..] {
      if !tracker.push_frame(&entry.raw_frame) {
        break;
      }

      entry.emitted = true;
    }
  });
}

/// After a fork, nothing has been written to the child's output yet: mark
/// every surviving frame unemitted and forget pending pops. The shadow stack
/// itself survives in the thread that called fork.
pub(crate) fn reset_in_child() {
  let _ = PENDING_POPS.try_with(|cell| cell.set(0));

  let _ = SHADOW_STACK.try_with(|stack| {
    if let Some(frames) = stack.borrow_mut().as_mut() {
      for entry in frames.iter_mut() {
        entry.emitted = false;
      }
    }
  });
}

#[cfg(test)]
pub(crate) fn pending_pop_count() -> u32 {
  PENDING_POPS.try_with(Cell::get).unwrap_or(0)
}

#[cfg(test)]
pub(crate) fn stack_depth() -> usize {
  SHADOW_STACK
    .try_with(|stack| stack.borrow().as_ref().map_or(0, Vec::len))
    .unwrap_or(0)
}

#[cfg(test)]
pub(crate) fn clear_thread_state() {
  let _ = PENDING_POPS.try_with(|cell| cell.set(0));
  let _ = ENTRY_FRAME.try_with(|cell| cell.set(None));
  let _ = SHADOW_STACK.try_with(|stack| *stack.borrow_mut() = None);
}

#[cfg(test)]
fn mark_all_emitted() {
  let _ = SHADOW_STACK.try_with(|stack| {
    if let Some(frames) = stack.borrow_mut().as_mut() {
      for entry in frames.iter_mut() {
        entry.emitted = true;
      }
    }
  });
}

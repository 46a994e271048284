use std::{
  fs::File,
  io::{Read, Seek, SeekFrom},
  sync::{Arc, Condvar, Mutex},
  thread,
  time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::guard::RecursionGuard;
use crate::records::{MemoryRecord, Record};
use crate::tracker::Tracker;
use crate::writer::RecordWriter;

struct SamplerShared {
  stop: Mutex<bool>,
  wakeup: Condvar,
}

enum RssReading {
  Bytes(u64),
  Unreadable,
}

/// Auxiliary thread that periodically appends the process's resident-set
/// size to the output stream. The thread marks itself as in-tracker for its
/// entire lifetime so its own allocations are never recorded.
pub(crate) struct BackgroundSampler {
  shared: Arc<SamplerShared>,
  thread: Option<thread::JoinHandle<()>>,
}

impl BackgroundSampler {
  pub(crate) fn start(
    writer: Arc<RecordWriter>,
    statm: File,
    interval: Duration,
  ) -> Self {
    let shared = Arc::new(SamplerShared {
      stop: Mutex::new(false),
      wakeup: Condvar::new(),
    });

    let worker_shared = Arc::clone(&shared);

    let thread = thread::spawn(move || {
      RecursionGuard::set_thread_flag(true);
      run(&worker_shared, &writer, statm, interval);
    });

    Self {
      shared,
      thread: Some(thread),
    }
  }

  /// Request shutdown and wait for the thread, swallowing join errors.
  pub(crate) fn stop(mut self) {
    {
      let mut stop = match self.shared.stop.lock() {
        Ok(guard) => guard,
        Err(err) => err.into_inner(),
      };

      *stop = true;
      self.shared.wakeup.notify_one();
    }

    if let Some(thread) = self.thread.take() {
      let _ = thread.join();
    }
  }
}

fn run(
  shared: &SamplerShared,
  writer: &RecordWriter,
  mut statm: File,
  interval: Duration,
) {
  let page_size = page_size();

  loop {
    {
      let stop = match shared.stop.lock() {
        Ok(guard) => guard,
        Err(err) => err.into_inner(),
      };

      let (stop, _timeout) = match shared
        .wakeup
        .wait_timeout_while(stop, interval, |stop| !*stop)
      {
        Ok(result) => result,
        Err(err) => err.into_inner(),
      };

      if *stop {
        break;
      }
    }

    match read_rss(&mut statm, page_size) {
      RssReading::Bytes(0) => {
        eprintln!("memtrace: RSS reported as zero, deactivating tracking");
        Tracker::deactivate();
        break;
      }
      RssReading::Bytes(rss_bytes) => {
        let record = Record::Memory(MemoryRecord {
          time_ms: wall_clock_ms(),
          rss_bytes,
        });

        if writer.write_record(&record).is_err() {
          eprintln!("memtrace: failed to write output, deactivating tracking");
          Tracker::deactivate();
          break;
        }
      }
      RssReading::Unreadable => {
        eprintln!(
          "memtrace: failed to read RSS from /proc/self/statm, deactivating tracking"
        );
        Tracker::deactivate();
        break;
      }
    }
  }
}

fn read_rss(statm: &mut File, page_size: u64) -> RssReading {
  let mut buffer = [0u8; 128];

  if statm.seek(SeekFrom::Start(0)).is_err() {
    return RssReading::Unreadable;
  }

  let length = match statm.read(&mut buffer) {
    Ok(length) => length,
    Err(_) => return RssReading::Unreadable,
  };

  let Ok(contents) = std::str::from_utf8(&buffer[..length]) else {
    return RssReading::Unreadable;
  };

  match parse_statm_rss(contents) {
    Some(pages) => RssReading::Bytes(pages.saturating_mul(page_size)),
    None => RssReading::Unreadable,
  }
}

/// The second field of `/proc/self/statm` is the resident page count.
fn parse_statm_rss(contents: &str) -> Option<u64> {
  contents.split_whitespace().nth(1)?.parse().ok()
}

fn page_size() -> u64 {
  // SAFETY: sysconf has no preconditions.
  let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

  if raw > 0 { raw as u64 } else { 4096 }
}

fn wall_clock_ms() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|elapsed| elapsed.as_millis() as u64)
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::records::decode_stream;
  use crate::writer::BufferSink;

  #[test]
  fn parses_the_resident_field() {
    assert_eq!(parse_statm_rss("4496 1256 1056 12 0 172 0\n"), Some(1256));
    assert_eq!(parse_statm_rss("4496"), None);
    assert_eq!(parse_statm_rss(""), None);
    assert_eq!(parse_statm_rss("4496 garbage 1056"), None);
  }

  #[cfg(target_os = "linux")]
  #[test]
  fn samples_rss_until_stopped() {
    let sink = BufferSink::new();
    let buffer = sink.buffer();
    let writer = Arc::new(RecordWriter::new(Box::new(sink), false));

    let statm = File::open("/proc/self/statm").expect("statm unavailable");

    let sampler =
      BackgroundSampler::start(writer, statm, Duration::from_millis(1));

    thread::sleep(Duration::from_millis(30));
    sampler.stop();

    let bytes = buffer.lock().unwrap().clone();
    let records = decode_stream(&bytes).unwrap();

    let samples: Vec<_> = records
      .iter()
      .filter_map(|record| match record {
        Record::Memory(memory) => Some(memory),
        _ => None,
      })
      .collect();

    assert!(!samples.is_empty());
    assert!(samples.iter().all(|sample| sample.rss_bytes > 0));
  }

  #[cfg(target_os = "linux")]
  #[test]
  fn stop_returns_promptly_for_long_intervals() {
    let writer =
      Arc::new(RecordWriter::new(Box::new(BufferSink::new()), false));

    let statm = File::open("/proc/self/statm").expect("statm unavailable");

    let sampler =
      BackgroundSampler::start(writer, statm, Duration::from_secs(3600));

    let started = std::time::Instant::now();
    sampler.stop();

    assert!(started.elapsed() < Duration::from_secs(5));
  }
}

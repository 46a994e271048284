use memtrace::{
  AllocatorKind, BufferSink, Record, RecordWriter, Tracker, TrackerConfig,
  decode_stream,
};

fn main() {
  let sink = BufferSink::new();
  let buffer = sink.buffer();

  let writer = RecordWriter::new(Box::new(sink), false);

  if let Err(err) = Tracker::create(writer, TrackerConfig::default()) {
    eprintln!("failed to start tracking: {err}");
    return;
  }

  Tracker::register_thread_name("main");
  Tracker::track_allocation(0x1000, 128, AllocatorKind::Malloc);
  Tracker::track_allocation(0x2000, 64, AllocatorKind::Malloc);
  Tracker::track_deallocation(0x2000, 64, AllocatorKind::Free);
  Tracker::destroy();

  let bytes = match buffer.lock() {
    Ok(guard) => guard.clone(),
    Err(err) => err.into_inner().clone(),
  };

  let records = match decode_stream(&bytes) {
    Ok(records) => records,
    Err(err) => {
      eprintln!("capture stream did not decode: {err}");
      return;
    }
  };

  println!("=== demo capture ===");
  println!("{} bytes, {} records", bytes.len(), records.len());

  for record in &records {
    match record {
      Record::Allocation(allocation) => println!(
        "allocation addr={:#x} size={}B kind={:?} line={}",
        allocation.address,
        allocation.size,
        allocation.allocator(),
        allocation.lineno,
      ),
      Record::Memory(memory) => {
        println!("rss sample {}B at {}ms", memory.rss_bytes, memory.time_ms);
      }
      Record::Thread(thread) => {
        println!("thread {:#x} named {:?}", thread.thread_id, thread.name);
      }
      _ => {}
    }
  }
}

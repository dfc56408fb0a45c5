use std::{
    error::Error,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
    thread,
    time::Duration,
};

use super::QueueGuard;
use crate::SMQueue;

#[derive(Debug, Clone, PartialEq)]
struct TornReadTestMessage {
    id: u64,
    data: Vec<u8>,
}

impl TornReadTestMessage {
    fn new(id: u64, size: usize) -> Self {
        let val = (id % 250) as u8;
        TornReadTestMessage {
            id,
            data: vec![val; size],
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(12 + self.data.len());
        bytes.extend_from_slice(&self.id.to_le_bytes());
        bytes.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.data);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 12 {
            return None;
        }
        let id = u64::from_le_bytes(bytes[0..8].try_into().ok()?);
        let data_len = u32::from_le_bytes(bytes[8..12].try_into().ok()?) as usize;
        if bytes.len() != 12 + data_len {
            return None;
        }
        Some(TornReadTestMessage {
            id,
            data: bytes[12..].to_vec(),
        })
    }

    fn is_consistent(&self) -> bool {
        let expected_val = (self.id % 250) as u8;
        self.data.iter().all(|&byte| byte == expected_val)
    }
}

#[test]
fn test_torn_read_test_message_serialization() {
    let original = TornReadTestMessage::new(12345, 32);
    let decoded = TornReadTestMessage::from_bytes(&original.to_bytes()).expect("decode failed");
    assert_eq!(original, decoded);
    assert!(decoded.is_consistent());

    let mut inconsistent = original.clone();
    inconsistent.data[0] = inconsistent.data[0].wrapping_add(1);
    assert!(!inconsistent.is_consistent());
}

/// A fast writer laps a slow reader on a tiny ring; every element the
/// reader accepts must be whole and ids must only increase.
#[test]
fn test_reader_never_returns_torn_payloads() -> Result<(), Box<dyn Error>> {
    let message_size = 4096;
    let guard = QueueGuard::new("torn");
    let mut writer = SMQueue::create(guard.name(), 4, message_size + 12)?;
    let mut reader = SMQueue::open(guard.name())?;

    let stop_flag = Arc::new(AtomicBool::new(false));

    let writer_stop_flag = Arc::clone(&stop_flag);
    let writer_thread = thread::spawn(move || {
        let mut id = 0u64;
        while !writer_stop_flag.load(AtomicOrdering::Relaxed) {
            id += 1;
            let msg = TornReadTestMessage::new(id, message_size);
            writer
                .push(&msg.to_bytes())
                .expect("writer thread: push failed");
        }
        writer.stats()
    });

    let reader_stop_flag = Arc::clone(&stop_flag);
    let reader_thread = thread::spawn(move || {
        let mut buf = vec![0u8; reader.element_size()];
        let mut consistent_reads = 0usize;
        let mut torn_reads = 0usize;
        let mut last_id = 0u64;
        while !reader_stop_flag.load(AtomicOrdering::Relaxed) {
            match reader.try_pop(&mut buf).expect("reader thread: pop failed") {
                Some(len) => match TornReadTestMessage::from_bytes(&buf[..len]) {
                    Some(msg) if msg.is_consistent() && msg.id > last_id => {
                        last_id = msg.id;
                        consistent_reads += 1;
                    }
                    _ => torn_reads += 1,
                },
                None => thread::yield_now(),
            }
            // Slow the reader down so the writer laps it.
            for _ in 0..200 {
                std::hint::spin_loop();
            }
        }
        (consistent_reads, torn_reads, reader.stats())
    });

    thread::sleep(Duration::from_secs(2));
    stop_flag.store(true, AtomicOrdering::Relaxed);

    let writer_stats = writer_thread.join().expect("writer thread panicked");
    let (consistent_reads, torn_reads, reader_stats) =
        reader_thread.join().expect("reader thread panicked");

    println!(
        "written: {}, dropped: {}, consistent: {}, torn: {}, skipped: {}",
        writer_stats.pushed, writer_stats.dropped, consistent_reads, torn_reads, reader_stats.skipped
    );
    assert!(consistent_reads > 0, "reader never received anything");
    assert_eq!(torn_reads, 0, "reader returned torn or out-of-order payloads");
    assert!(writer_stats.pushed >= consistent_reads as u64);
    Ok(())
}

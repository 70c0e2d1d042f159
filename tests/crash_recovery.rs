//! Integration tests for flash ring recovery
//!
//! Simulates restarts and interrupted writes against file-backed and
//! in-memory flash, then checks where the recovered ring resumes.

use sensor_log::adapters::outbound::{FileFlash, ManualTickSource, MemFlash};
use sensor_log::application::{EventLog, FlashConfig, FlashStore, LogConfig};
use sensor_log::domain::codec::decode_events;
use sensor_log::domain::entities::EventCode;
use sensor_log::domain::ports::FlashDevice;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use tokio::sync::Notify;

const SECTOR: usize = 256;
const SECTORS: u32 = 8;
const QUIET: u32 = 10;

struct Node {
    store: FlashStore,
    log: EventLog,
    ticks: Arc<ManualTickSource>,
}

impl Node {
    fn boot(device: Box<dyn FlashDevice>) -> Self {
        let store = FlashStore::new(
            device,
            FlashConfig {
                first_sector: 0,
                num_sectors: SECTORS,
                ..FlashConfig::default()
            },
            Arc::new(Notify::new()),
        )
        .unwrap();
        let start = store.init();
        let ticks = Arc::new(ManualTickSource::new(0));
        let log = EventLog::new(
            LogConfig {
                buffer_count: 2,
                buffer_size: SECTOR,
                quiescence_ticks: QUIET,
            },
            ticks.clone(),
            Arc::new(Notify::new()),
            start,
            true,
        );
        Self { store, log, ticks }
    }

    /// Append one event that fills a whole buffer, then persist it.
    fn record_full_buffer(&self, fill: u8) {
        self.log
            .append_with_retry(EventCode::TEXT_MESSAGE, &[fill; 200], false);
        self.flush();
    }

    fn flush(&self) {
        self.ticks.advance(QUIET + 1);
        self.store.flush_pending(&self.log);
    }

    fn first_payload_byte(&self, index: u32) -> u8 {
        let bytes = self.store.get_buffer_range(index, 0, SECTOR).unwrap();
        decode_events(&bytes).next().unwrap().unwrap().payload[0]
    }
}

/// A restart on a file image resumes after the newest stored buffer
#[test]
fn test_file_flash_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flash.img");

    {
        let node = Node::boot(Box::new(FileFlash::open(&path, SECTOR, SECTORS).unwrap()));
        assert_eq!(node.log.head_index(), 0);
        for fill in 1..=3 {
            node.record_full_buffer(fill);
        }
        assert_eq!(node.store.get_buffer_size(u32::MAX).index, 2);
    }

    let node = Node::boot(Box::new(FileFlash::open(&path, SECTOR, SECTORS).unwrap()));
    assert_eq!(node.log.head_index(), 3);
    assert_eq!(node.first_payload_byte(0), 1);
    assert_eq!(node.first_payload_byte(2), 3);

    node.record_full_buffer(4);
    let head = node.store.get_buffer_size(u32::MAX);
    assert_eq!(head.index, 3);
    assert_eq!(node.store.get_buffer_size(2).next_index, Some(3));
}

/// After wrapping the ring, only the newest sectors remain
#[test]
fn test_file_flash_wrapped_ring() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flash.img");

    {
        let node = Node::boot(Box::new(FileFlash::open(&path, SECTOR, SECTORS).unwrap()));
        for fill in 0..12 {
            node.record_full_buffer(fill);
        }
    }

    let node = Node::boot(Box::new(FileFlash::open(&path, SECTOR, SECTORS).unwrap()));
    assert_eq!(node.log.head_index(), 12);

    let oldest = node.store.get_buffer_size(0);
    assert_eq!(oldest.index, 4);
    assert_eq!(oldest.next_index, Some(5));
    assert!(node.store.get_buffer_range(3, 0, SECTOR).is_none());
    assert_eq!(node.first_payload_byte(11), 11);
}

/// A damaged header on the newest sector is not trusted on restart
#[test]
fn test_damaged_newest_header_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flash.img");

    {
        let node = Node::boot(Box::new(FileFlash::open(&path, SECTOR, SECTORS).unwrap()));
        for fill in 0..3 {
            node.record_full_buffer(fill);
        }
    }

    // Clear bits in the complement half of the header of index 2 (sector 2).
    {
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(2 * SECTOR as u64 + 4)).unwrap();
        file.write_all(&[0, 0, 0, 0]).unwrap();
        file.sync_all().unwrap();
    }

    let node = Node::boot(Box::new(FileFlash::open(&path, SECTOR, SECTORS).unwrap()));
    // Index 1 is the last verified buffer.
    assert_eq!(node.log.head_index(), 2);
    assert_eq!(node.store.get_buffer_size(u32::MAX).index, 1);

    // The damaged sector is reused once the ring gets there.
    node.record_full_buffer(9);
    assert_eq!(node.first_payload_byte(2), 9);
}

/// Power loss in the middle of a fresh sector write moves on to the next
#[test]
fn test_torn_fresh_write_is_retried() {
    let flash = MemFlash::new(SECTOR, SECTORS);
    let node = Node::boot(Box::new(flash.clone()));
    node.record_full_buffer(1);

    // Only the index word of buffer 1 reaches the device.
    flash.tear_next_write(4);
    node.record_full_buffer(2);

    let stats = node.store.stats();
    assert_eq!(stats.write_failures, 1);
    assert_eq!(stats.head_sector, 2);
    assert_eq!(node.first_payload_byte(1), 2);
    drop(node);

    let node = Node::boot(Box::new(flash.clone()));
    assert_eq!(node.log.head_index(), 2);
    let size = node.store.get_buffer_size(1);
    assert_eq!(size.index, 1);
    assert_eq!(size.next_index, None);
}

/// A torn in-place rewrite invalidates the sector and rewrites it whole
#[test]
fn test_torn_rewrite_invalidates_head() {
    let flash = MemFlash::new(SECTOR, SECTORS);
    let node = Node::boot(Box::new(flash.clone()));
    node.log
        .append_with_retry(EventCode::TEXT_MESSAGE, &[1; 40], false);
    node.flush();

    flash.tear_next_write(4);
    node.log
        .append_with_retry(EventCode::TEXT_MESSAGE, &[2; 40], false);
    node.flush();

    // Sector 0 was erased so its partial copy cannot be mistaken for data.
    assert!(flash.sector(0).iter().all(|b| *b == 0xff));
    assert_eq!(node.store.stats().head_sector, 1);

    let bytes = node.store.get_buffer_range(0, 0, SECTOR).unwrap();
    let fills: Vec<u8> = decode_events(&bytes)
        .map(|e| e.unwrap().payload[0])
        .collect();
    assert_eq!(fills, vec![1, 2]);
    drop(node);

    let node = Node::boot(Box::new(flash));
    assert_eq!(node.log.head_index(), 1);
}

/// Every write failing abandons the buffer instead of blocking the log
#[test]
fn test_persistent_failures_abandon_buffer() {
    let flash = MemFlash::new(SECTOR, SECTORS);
    let node = Node::boot(Box::new(flash.clone()));

    flash.fail_next_writes(u32::MAX);
    node.record_full_buffer(1);
    assert_eq!(node.store.stats().write_failures, 9);
    assert_eq!(node.store.get_buffer_size(u32::MAX).size, 0);

    // The log moved on; a later buffer is stored once the device recovers.
    flash.fail_next_writes(0);
    node.record_full_buffer(2);
    let head = node.store.get_buffer_size(u32::MAX);
    assert_eq!(head.index, 1);
    assert_eq!(node.first_payload_byte(1), 2);
}

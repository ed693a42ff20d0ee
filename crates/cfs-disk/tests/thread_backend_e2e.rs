//! End-to-end exercise of the thread-pool submission backend: submit real
//! reads/writes/syncs against a temp file and reap them through ticks, the
//! way the event loop would.

use cfs_buf::ByteBlock;
use cfs_disk::{DiskConnection, DiskEventKind, DiskFile, DiskManager, EventRef, ThreadAioBackend};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct TickingConn {
    completions: Mutex<Vec<(DiskEventKind, i64, i32)>>,
}

impl DiskConnection for TickingConn {
    fn on_disk_done(&self, event: &EventRef, errno: i32) {
        self.completions
            .lock()
            .push((event.kind(), event.retval(), errno));
    }
}

fn reap_until(manager: &DiskManager, conn: &TickingConn, want: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while conn.completions.lock().len() < want {
        assert!(Instant::now() < deadline, "completions did not arrive");
        manager.reap();
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn write_sync_read_round_trip_through_ticks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("chunk.dat");
    std::fs::write(&path, vec![0_u8; 1024]).expect("seed file");

    let backend = ThreadAioBackend::new(2).expect("spawn backend");
    let manager = DiskManager::new(backend);
    let conn = Arc::new(TickingConn::default());
    let conn_dyn: Arc<dyn DiskConnection> = conn.clone();

    let file = DiskFile::open(&manager, &path).expect("open disk file");

    // Write a payload at offset 256.
    let out = ByteBlock::new(64).into_ref();
    out.lock().copy_in(b"payload under test");
    file.write_from(&conn_dyn, &out, 256, 18)
        .expect("submit write");
    reap_until(&manager, &conn, 1);

    // Persist it.
    file.sync(&conn_dyn).expect("submit sync");
    reap_until(&manager, &conn, 2);

    // Read it back into a fresh block.
    let back = ByteBlock::new(64).into_ref();
    file.read_into(&conn_dyn, &back, 256, 18)
        .expect("submit read");
    reap_until(&manager, &conn, 3);

    let completions = conn.completions.lock().clone();
    assert_eq!(completions[0], (DiskEventKind::Write, 18, 0));
    assert_eq!(completions[1], (DiskEventKind::Sync, 0, 0));
    assert_eq!(completions[2], (DiskEventKind::Read, 18, 0));

    let mut buf = [0_u8; 18];
    assert_eq!(back.lock().copy_out(&mut buf), 18);
    assert_eq!(&buf, b"payload under test");
    assert_eq!(manager.in_flight(), 0);
}

#[test]
fn read_past_eof_completes_with_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("short.dat");
    std::fs::write(&path, b"tiny").expect("seed file");

    let backend = ThreadAioBackend::new(1).expect("spawn backend");
    let manager = DiskManager::new(backend);
    let conn = Arc::new(TickingConn::default());
    let conn_dyn: Arc<dyn DiskConnection> = conn.clone();
    let file = DiskFile::open(&manager, &path).expect("open disk file");

    let block = ByteBlock::new(32).into_ref();
    file.read_into(&conn_dyn, &block, 4096, 32)
        .expect("submit read");
    reap_until(&manager, &conn, 1);

    let completions = conn.completions.lock().clone();
    assert_eq!(completions[0], (DiskEventKind::Read, 0, 0));
    assert_eq!(block.lock().bytes_consumable(), 0);
}

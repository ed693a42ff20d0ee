//! End-to-end crash-recovery scenarios: checkpoint + log chain in, full
//! in-memory state out.

use cfs_meta::record::LogRecord;
use cfs_meta::tree::{MetaTree, ROOT_ID};
use cfs_meta::{StartupConfig, startup, write_checkpoint};
use cfs_types::{FileId, LogFileNumber, SeqNo};
use std::path::Path;

fn write_log_file(logdir: &Path, number: u64, records: &[(u64, LogRecord)]) {
    let mut contents = String::from("version/1\ntime/1700000000\n");
    for (seq, record) in records {
        contents.push_str(&record.to_line(SeqNo(*seq)));
        contents.push('\n');
    }
    std::fs::write(logdir.join(format!("log.{number}")), contents).expect("write log file");
}

fn mkdir_record(name: &str, id: u64) -> LogRecord {
    LogRecord::Mkdir {
        dir: ROOT_ID,
        name: name.to_owned(),
        id: FileId(id),
    }
}

/// Checkpoint at seq 100 with logs 100..=105: replay applies 101..=105 in
/// order and the counter lands at 105.
#[test]
fn checkpoint_plus_log_chain_recovers_to_latest_seq() {
    let dir = tempfile::tempdir().expect("tempdir");
    let logdir = dir.path().join("log");
    let cpdir = dir.path().join("cp");
    std::fs::create_dir_all(&logdir).expect("mk logdir");
    std::fs::create_dir_all(&cpdir).expect("mk cpdir");

    // The checkpointed tree already reflects seq 100.
    let mut base = MetaTree::new();
    base.mkdir(ROOT_ID, "d100", FileId(100)).expect("mkdir");
    base.set_applied(SeqNo(100));
    write_checkpoint(&cpdir, &base).expect("write checkpoint");

    // log.100 holds the already-covered record; 101..=105 are new.
    write_log_file(&logdir, 100, &[(100, mkdir_record("d100", 100))]);
    for n in 101..=105_u64 {
        write_log_file(&logdir, n, &[(n, mkdir_record(&format!("d{n}"), n))]);
    }

    let state = startup(&StartupConfig {
        logdir: logdir.clone(),
        cpdir,
        min_chunkservers: 0,
    })
    .expect("startup");

    let tree = state.tree.lock();
    assert_eq!(tree.applied(), SeqNo(105));
    for n in 100..=105_u64 {
        assert_eq!(
            tree.lookup(ROOT_ID, &format!("d{n}")),
            Some(FileId(n)),
            "directory d{n} must exist after recovery"
        );
    }
    drop(tree);

    // The fresh log continues the numbering.
    assert_eq!(state.logger.number(), LogFileNumber(106));
    assert!(logdir.join("log.106").exists());
    assert!(state.gate.is_ready());
}

/// Removing log 103 from the chain is a fatal sequence gap.
#[test]
fn missing_log_file_fails_startup_with_sequence_gap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let logdir = dir.path().join("log");
    let cpdir = dir.path().join("cp");
    std::fs::create_dir_all(&logdir).expect("mk logdir");
    std::fs::create_dir_all(&cpdir).expect("mk cpdir");

    let mut base = MetaTree::new();
    base.set_applied(SeqNo(100));
    write_checkpoint(&cpdir, &base).expect("write checkpoint");

    for n in [100_u64, 101, 102, 104, 105] {
        write_log_file(&logdir, n, &[(n, mkdir_record(&format!("d{n}"), n))]);
    }

    let err = startup(&StartupConfig {
        logdir,
        cpdir,
        min_chunkservers: 0,
    })
    .expect_err("gap must abort startup");
    assert!(matches!(
        err,
        cfs_error::CfsError::SequenceGap {
            expected: 103,
            found: 104
        }
    ));
}

/// Restore + replay is deterministic: two recoveries from the same
/// artifacts serialize identically.
#[test]
fn recovery_is_deterministic() {
    let dir = tempfile::tempdir().expect("tempdir");
    let logdir = dir.path().join("log");
    let cpdir = dir.path().join("cp");
    std::fs::create_dir_all(&logdir).expect("mk logdir");
    std::fs::create_dir_all(&cpdir).expect("mk cpdir");

    let mut base = MetaTree::new();
    base.mkdir(ROOT_ID, "base", FileId(3)).expect("mkdir");
    base.set_applied(SeqNo(10));
    write_checkpoint(&cpdir, &base).expect("write checkpoint");
    write_log_file(
        &logdir,
        11,
        &[
            (11, mkdir_record("a", 11)),
            (
                12,
                LogRecord::Create {
                    dir: FileId(11),
                    name: "f".to_owned(),
                    id: FileId(12),
                    num_replicas: 3,
                },
            ),
        ],
    );

    let run = |suffix: &str| {
        // Each run replays into its own scratch copy of the artifacts so
        // the fresh-log side effect cannot contaminate the other run.
        let scratch = dir.path().join(suffix);
        let scratch_log = scratch.join("log");
        let scratch_cp = scratch.join("cp");
        std::fs::create_dir_all(&scratch_log).expect("mk scratch logdir");
        std::fs::create_dir_all(&scratch_cp).expect("mk scratch cpdir");
        for entry in std::fs::read_dir(&logdir).expect("read logdir") {
            let path = entry.expect("entry").path();
            std::fs::copy(&path, scratch_log.join(path.file_name().expect("name")))
                .expect("copy log");
        }
        for entry in std::fs::read_dir(&cpdir).expect("read cpdir") {
            let path = entry.expect("entry").path();
            std::fs::copy(&path, scratch_cp.join(path.file_name().expect("name")))
                .expect("copy checkpoint");
        }
        let state = startup(&StartupConfig {
            logdir: scratch_log,
            cpdir: scratch_cp,
            min_chunkservers: 0,
        })
        .expect("startup");
        let body = state.tree.lock().serialize_body();
        body
    };

    assert_eq!(run("first"), run("second"));
}

/// A restored-and-replayed tree checkpoints back out and restores again to
/// the same canonical state.
#[test]
fn recovered_state_round_trips_through_a_new_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let logdir = dir.path().join("log");
    let cpdir = dir.path().join("cp");
    std::fs::create_dir_all(&logdir).expect("mk logdir");
    std::fs::create_dir_all(&cpdir).expect("mk cpdir");

    write_log_file(
        &logdir,
        1,
        &[(1, mkdir_record("only", 7))],
    );

    let state = startup(&StartupConfig {
        logdir,
        cpdir: cpdir.clone(),
        min_chunkservers: 0,
    })
    .expect("startup");

    let cp2dir = dir.path().join("cp2");
    std::fs::create_dir_all(&cp2dir).expect("mk cp2");
    let path = write_checkpoint(&cp2dir, &state.tree.lock()).expect("write new checkpoint");
    let restored = cfs_meta::Restorer::rebuild(&path).expect("restore new checkpoint");
    assert_eq!(
        restored.serialize_body(),
        state.tree.lock().serialize_body()
    );
    assert_eq!(restored.applied(), SeqNo(1));
}

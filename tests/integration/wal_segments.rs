#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

use penumbra::ops::control::{AtomicUnitEnd, FullCheckpoint, ATOMIC_UNIT_END, FULL_CHECKPOINT};
use penumbra::primitives::io::segment_path;
use penumbra::primitives::wal::{
    RecordRegistry, WalOptions, WriteAheadLog, SEGMENT_HEADER_LEN, WAL_EXTENSION,
};
use penumbra::types::{Lsn, Result, StorageError, UnitId};
use tempfile::tempdir;

fn open(dir: &std::path::Path, segment_size: usize) -> Result<WriteAheadLog> {
    WriteAheadLog::open(
        dir,
        "log",
        Arc::new(RecordRegistry::builtin()),
        WalOptions::new(segment_size),
    )
}

#[test]
fn records_span_rotated_segments_in_order() -> Result<()> {
    let dir = tempdir()?;
    let wal = open(dir.path(), 256)?;
    let mut lsns = Vec::new();
    for unit in 1..=40u64 {
        lsns.push(wal.log(&AtomicUnitEnd::new(UnitId(unit)))?);
    }
    wal.flush()?;
    assert!(wal.stats().rotations > 0, "small segments should rotate");
    assert!(lsns.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(wal.begin(), Some(lsns[0]));
    assert_eq!(wal.end(), lsns.last().copied());

    let mut walked = Vec::new();
    let mut cursor = wal.begin();
    while let Some(lsn) = cursor {
        walked.push(lsn);
        cursor = wal.next(lsn);
    }
    assert_eq!(walked, lsns);

    let units: Vec<u64> = wal
        .cursor(Lsn::ZERO)
        .map(|item| item.map(|(_, record)| record.unit_id().0))
        .collect::<Result<_>>()?;
    assert_eq!(units, (1..=40).collect::<Vec<_>>());
    wal.close()?;
    Ok(())
}

#[test]
fn reopen_keeps_records_and_appends_to_new_segment() -> Result<()> {
    let dir = tempdir()?;
    let first = {
        let wal = open(dir.path(), 64 * 1024)?;
        let lsn = wal.log(&FullCheckpoint::new(Lsn::ZERO))?;
        wal.log(&AtomicUnitEnd::new(UnitId(7)))?;
        wal.flush()?;
        lsn
    };

    let wal = open(dir.path(), 64 * 1024)?;
    assert_eq!(wal.max_unit_id(), UnitId(7));
    assert_eq!(wal.read(first)?.record_type(), FULL_CHECKPOINT);
    let next = wal.log(&AtomicUnitEnd::new(UnitId(8)))?;
    assert!(next.segment > first.segment);
    assert_eq!(wal.read(next)?.record_type(), ATOMIC_UNIT_END);
    Ok(())
}

#[test]
fn cut_till_keeps_the_segment_holding_the_cut_point() -> Result<()> {
    let dir = tempdir()?;
    let wal = open(dir.path(), 256)?;
    let lsns: Vec<Lsn> = (0..40u64)
        .map(|unit| wal.log(&AtomicUnitEnd::new(UnitId(unit))))
        .collect::<Result<_>>()?;
    wal.flush()?;
    let cut = lsns[25];
    let removed = wal.cut_till(cut)?;
    assert!(removed > 0);
    let begin = wal.begin().ok_or(StorageError::NotFound)?;
    assert!(begin <= cut);
    assert_eq!(begin.segment, cut.segment);
    assert!(wal.read(cut).is_ok());
    assert!(matches!(wal.read(lsns[0]), Err(StorageError::NotFound)));
    Ok(())
}

#[test]
fn torn_tail_is_dropped_on_reopen() -> Result<()> {
    let dir = tempdir()?;
    let kept = {
        let wal = open(dir.path(), 64 * 1024)?;
        let kept = wal.log(&AtomicUnitEnd::new(UnitId(1)))?;
        wal.log(&AtomicUnitEnd::new(UnitId(2)))?;
        wal.flush()?;
        kept
    };
    // Cut the second frame in half.
    let path = segment_path(dir.path(), "log", 1, WAL_EXTENSION);
    let len = std::fs::metadata(&path)?.len();
    OpenOptions::new().write(true).open(&path)?.set_len(len - 6)?;

    let wal = open(dir.path(), 64 * 1024)?;
    let records: Vec<Lsn> = wal
        .cursor(Lsn::ZERO)
        .map(|item| item.map(|(lsn, _)| lsn))
        .collect::<Result<_>>()?;
    assert_eq!(records, vec![kept]);
    Ok(())
}

#[test]
fn corrupt_frame_is_reported_once_and_later_segments_still_read() -> Result<()> {
    let dir = tempdir()?;
    {
        let wal = open(dir.path(), 256)?;
        for unit in 1..=30u64 {
            wal.log(&AtomicUnitEnd::new(UnitId(unit)))?;
        }
        wal.flush()?;
    }
    let path = segment_path(dir.path(), "log", 1, WAL_EXTENSION);
    let mut file = OpenOptions::new().write(true).open(&path)?;
    file.seek(SeekFrom::Start(SEGMENT_HEADER_LEN as u64 + 12))?;
    file.write_all(&[0xFF; 4])?;
    file.sync_all()?;
    drop(file);

    let wal = open(dir.path(), 256)?;
    let mut corrupt = 0;
    let mut units = Vec::new();
    for item in wal.cursor(Lsn::ZERO) {
        match item {
            Ok((_, record)) => units.push(record.unit_id().0),
            Err(StorageError::SegmentCorrupt { segment, .. }) => {
                assert_eq!(segment, 1);
                corrupt += 1;
            }
            Err(err) => return Err(err),
        }
    }
    assert_eq!(corrupt, 1);
    assert_eq!(units.last().copied(), Some(30));
    assert!(!units.contains(&1));
    Ok(())
}

fn collect_units(wal: &WriteAheadLog) -> Result<(Vec<u64>, Vec<u64>)> {
    let mut units = Vec::new();
    let mut corrupt = Vec::new();
    for item in wal.cursor(Lsn::ZERO) {
        match item {
            Ok((_, record)) => units.push(record.unit_id().0),
            Err(StorageError::SegmentCorrupt { segment, .. }) => corrupt.push(segment),
            Err(err) => return Err(err),
        }
    }
    Ok((units, corrupt))
}

#[test]
fn bad_length_prefix_in_sealed_segment_is_reported() -> Result<()> {
    let dir = tempdir()?;
    {
        let wal = open(dir.path(), 256)?;
        for unit in 1..=30u64 {
            wal.log(&AtomicUnitEnd::new(UnitId(unit)))?;
        }
        wal.flush()?;
    }
    // 27-byte frames: segment 1 holds units 1..=8.
    let path = segment_path(dir.path(), "log", 1, WAL_EXTENSION);
    let mut file = OpenOptions::new().write(true).open(&path)?;
    file.seek(SeekFrom::Start(SEGMENT_HEADER_LEN as u64))?;
    file.write_all(&[0xFF; 4])?;
    file.sync_all()?;
    drop(file);

    let wal = open(dir.path(), 256)?;
    let (units, corrupt) = collect_units(&wal)?;
    assert_eq!(corrupt, vec![1]);
    assert_eq!(units, (9..=30).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn torn_tail_stays_clean_across_repeated_crashes() -> Result<()> {
    let dir = tempdir()?;
    {
        let wal = open(dir.path(), 64 * 1024)?;
        for unit in 1..=3u64 {
            wal.log(&AtomicUnitEnd::new(UnitId(unit)))?;
        }
        wal.flush()?;
    }
    let path = segment_path(dir.path(), "log", 1, WAL_EXTENSION);
    let len = std::fs::metadata(&path)?.len();
    OpenOptions::new().write(true).open(&path)?.set_len(len - 4)?;

    // First restart drops the tail; the second sees segment 1 as an older
    // segment and must not call it corrupt.
    drop(open(dir.path(), 64 * 1024)?);
    assert!(std::fs::metadata(&path)?.len() < len - 4);
    let wal = open(dir.path(), 64 * 1024)?;
    let (units, corrupt) = collect_units(&wal)?;
    assert!(corrupt.is_empty());
    assert_eq!(units, vec![1, 2]);
    Ok(())
}

#[test]
fn zero_length_frame_before_live_data_is_reported() -> Result<()> {
    let dir = tempdir()?;
    let second = {
        let wal = open(dir.path(), 64 * 1024)?;
        wal.log(&AtomicUnitEnd::new(UnitId(1)))?;
        let second = wal.log(&AtomicUnitEnd::new(UnitId(2)))?;
        wal.log(&AtomicUnitEnd::new(UnitId(3)))?;
        wal.flush()?;
        second
    };
    let path = segment_path(dir.path(), "log", 1, WAL_EXTENSION);
    let mut file = OpenOptions::new().write(true).open(&path)?;
    file.seek(SeekFrom::Start(second.position))?;
    file.write_all(&[0; 4])?;
    file.sync_all()?;
    drop(file);

    let wal = open(dir.path(), 64 * 1024)?;
    let (units, corrupt) = collect_units(&wal)?;
    assert_eq!(units, vec![1]);
    assert_eq!(corrupt, vec![1]);
    Ok(())
}

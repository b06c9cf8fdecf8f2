#![allow(missing_docs)]

use penumbra::dwl::{DoubleWrite, DoubleWriteLog, DoubleWriteOptions, NoDoubleWrite, DWL_EXTENSION};
use penumbra::primitives::io::list_segments;
use penumbra::types::{PageKey, Result, StorageError};
use tempfile::tempdir;

const PAGE: usize = 4096;

fn page(fill: u8) -> Vec<u8> {
    let mut buf = vec![fill; PAGE];
    buf[..8].copy_from_slice(&u64::from(fill).to_be_bytes());
    buf
}

#[test]
fn batch_is_restorable_after_reopen() -> Result<()> {
    let dir = tempdir()?;
    let pages = [page(1), page(2), page(3)];
    {
        let dwl = DoubleWriteLog::open(dir.path(), "store", DoubleWriteOptions::default())?;
        let refs: Vec<&[u8]> = pages.iter().map(Vec::as_slice).collect();
        assert!(!dwl.write(4, 10, &refs)?);
        dwl.close()?;
    }

    let dwl = DoubleWriteLog::open(dir.path(), "store", DoubleWriteOptions::default())?;
    dwl.restore_mode_on()?;
    assert_eq!(
        dwl.restored_pages(),
        vec![PageKey::new(4, 10), PageKey::new(4, 11), PageKey::new(4, 12)]
    );
    for (i, expected) in pages.iter().enumerate() {
        let image = dwl
            .load_page(PageKey::new(4, 10 + i as u32))?
            .ok_or(StorageError::NotFound)?;
        assert_eq!(&image[..], &expected[..]);
    }
    assert!(dwl.load_page(PageKey::new(4, 13))?.is_none());
    assert!(dwl.load_page(PageKey::new(5, 10))?.is_none());

    // Segments survive while the log is restoring.
    dwl.truncate()?;
    assert!(!list_segments(dir.path(), "store", DWL_EXTENSION)?.is_empty());
    assert!(matches!(dwl.write(4, 10, &[&pages[0]]), Err(StorageError::Invalid(_))));

    dwl.restore_mode_off();
    assert!(dwl.restored_pages().is_empty());
    dwl.truncate()?;
    assert!(list_segments(dir.path(), "store", DWL_EXTENSION)?.is_empty());
    Ok(())
}

#[test]
fn later_image_of_a_page_wins() -> Result<()> {
    let dir = tempdir()?;
    {
        let dwl = DoubleWriteLog::open(dir.path(), "store", DoubleWriteOptions::default())?;
        dwl.write(1, 0, &[&page(1), &page(2)])?;
        dwl.write(1, 1, &[&page(9)])?;
        dwl.close()?;
    }
    let dwl = DoubleWriteLog::open(dir.path(), "store", DoubleWriteOptions::default())?;
    dwl.restore_mode_on()?;
    let first = dwl.load_page(PageKey::new(1, 0))?.ok_or(StorageError::NotFound)?;
    let second = dwl.load_page(PageKey::new(1, 1))?.ok_or(StorageError::NotFound)?;
    assert_eq!(&first[..], &page(1)[..]);
    assert_eq!(&second[..], &page(9)[..]);
    Ok(())
}

#[test]
fn reaching_max_log_size_asks_for_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let options = DoubleWriteOptions {
        block_size: 512,
        segment_size: 2048,
        max_log_size: 4096,
    };
    let dwl = DoubleWriteLog::open(dir.path(), "store", options)?;
    let mut asked = false;
    for i in 0..64u32 {
        let image: Vec<u8> = (0..PAGE).map(|b| (b as u32 * 31 + i * 7) as u8).collect();
        if dwl.write(2, i, &[&image])? {
            asked = true;
            break;
        }
    }
    assert!(asked);
    let stats = dwl.stats();
    assert!(stats.log_size >= 4096);
    assert_eq!(stats.bytes_written % 512, 0);
    assert!(list_segments(dir.path(), "store", DWL_EXTENSION)?.len() >= 2);

    dwl.truncate()?;
    assert_eq!(dwl.stats().log_size, 0);
    assert!(list_segments(dir.path(), "store", DWL_EXTENSION)?.is_empty());
    assert!(!dwl.write(2, 0, &[&page(4)])?);
    Ok(())
}

#[test]
fn disabled_double_write_keeps_nothing() -> Result<()> {
    let dwl = NoDoubleWrite;
    assert!(!dwl.write(1, 0, &[&page(1)])?);
    dwl.restore_mode_on()?;
    assert!(dwl.restored_pages().is_empty());
    assert!(dwl.load_page(PageKey::new(1, 0))?.is_none());
    dwl.truncate()?;
    Ok(())
}

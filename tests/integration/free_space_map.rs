#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use penumbra::fsm::{FreeSpaceMap, SLOTS_PER_LEAF};
use penumbra::primitives::io::StdFileIo;
use penumbra::types::Result;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

const PAGE_SIZE: usize = 8192;
const SEED: u64 = 0xf5e_5eed;
const ROUNDS: usize = 4_000;

/// Lowest page whose bucket clears the request, computed the slow way.
fn expected(map: &FreeSpaceMap, model: &BTreeMap<u32, usize>, min_free: usize) -> Option<u32> {
    let target = min_free / map.interval() + 1;
    model
        .iter()
        .find(|(_, &free)| usize::from(map.bucket_of(free)) >= target)
        .map(|(&page, _)| page)
}

#[test]
fn random_churn_matches_linear_scan_and_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("data_1.fsm");
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let mut model: BTreeMap<u32, usize> = BTreeMap::new();
    let max_page = (SLOTS_PER_LEAF * 3) as u32;

    {
        let map = FreeSpaceMap::create(Arc::new(StdFileIo::open(&path)?), PAGE_SIZE)?;
        for round in 0..ROUNDS {
            let page = rng.gen_range(0..max_page);
            let free = rng.gen_range(0..=PAGE_SIZE);
            let root = map.update_page_max_free_space(page, free)?;
            model.insert(page, free);
            let best = model.values().map(|&f| map.bucket_of(f)).max().unwrap_or(0);
            assert_eq!(root, best, "root bucket after round {round}");

            let query = rng.gen_range(0..PAGE_SIZE);
            assert_eq!(map.find_page(query), expected(&map, &model, query), "query {query}");
        }
        map.flush()?;
    }

    let map = FreeSpaceMap::open(Arc::new(StdFileIo::open(&path)?), PAGE_SIZE)?;
    let tracked = model.keys().next_back().map_or(0, |&p| u64::from(p) + 1);
    assert_eq!(map.tracked_pages(), tracked);
    for (&page, &free) in &model {
        assert_eq!(map.page_free_space(page), usize::from(map.bucket_of(free)) * map.interval());
    }
    for query in (0..PAGE_SIZE).step_by(97) {
        assert_eq!(map.find_page(query), expected(&map, &model, query));
    }
    Ok(())
}

#[test]
fn full_page_request_never_matches() -> Result<()> {
    let dir = tempdir()?;
    let map = FreeSpaceMap::create(
        Arc::new(StdFileIo::open(dir.path().join("data_2.fsm"))?),
        PAGE_SIZE,
    )?;
    map.update_page_max_free_space(9, PAGE_SIZE)?;
    assert_eq!(map.find_page(PAGE_SIZE - map.interval() - 1), Some(9));
    assert_eq!(map.find_page(PAGE_SIZE), None);
    assert_eq!(map.find_page(0), Some(9));

    map.update_page_max_free_space(9, 0)?;
    assert_eq!(map.max_free_bucket(), 0);
    assert_eq!(map.find_page(0), None);
    Ok(())
}

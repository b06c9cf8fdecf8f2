#![allow(missing_docs)]

use penumbra::ops::bucket::{AddLeafEntry, BucketInit, BucketView, RemoveLeafEntry, UpdateValue};
use penumbra::ops::cluster::{
    AppendRecord, ClusterInit, ClusterView, DeleteRecord, RecycleRecord, ReplaceRecord,
};
use penumbra::primitives::wal::record::serialize;
use penumbra::primitives::wal::{OperationRecord, RecordRegistry};
use penumbra::types::{PageKey, Result};
use proptest::prelude::*;

const PAGE_SIZE: usize = 4096;
const KEY: PageKey = PageKey::new(3, 17);

#[derive(Clone, Debug)]
enum ClusterOp {
    Append(i32, Vec<u8>),
    Replace(usize, i32, Vec<u8>),
    Delete(usize),
    Recycle(usize, i32, Vec<u8>),
}

#[derive(Clone, Debug)]
enum BucketOp {
    Insert(usize, Vec<u8>, Vec<u8>),
    Remove(usize),
    Update(usize, Vec<u8>),
}

fn content() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..48)
}

fn cluster_op() -> impl Strategy<Value = ClusterOp> {
    prop_oneof![
        3 => (any::<i32>(), content()).prop_map(|(v, c)| ClusterOp::Append(v, c)),
        2 => (any::<usize>(), any::<i32>(), content()).prop_map(|(s, v, c)| ClusterOp::Replace(s, v, c)),
        2 => any::<usize>().prop_map(ClusterOp::Delete),
        1 => (any::<usize>(), any::<i32>(), content()).prop_map(|(s, v, c)| ClusterOp::Recycle(s, v, c)),
    ]
}

fn bucket_op() -> impl Strategy<Value = BucketOp> {
    let bytes = |max| prop::collection::vec(any::<u8>(), 1..max);
    prop_oneof![
        3 => (any::<usize>(), bytes(16), bytes(32)).prop_map(|(i, k, v)| BucketOp::Insert(i, k, v)),
        1 => any::<usize>().prop_map(BucketOp::Remove),
        1 => (any::<usize>(), bytes(32)).prop_map(|(i, v)| BucketOp::Update(i, v)),
    ]
}

/// Applies `record` and checks that undo restores the page byte for byte,
/// that redo is repeatable and that the record survives serialization.
fn apply_checked(record: &dyn OperationRecord, page: &mut [u8]) -> Result<()> {
    let before = page.to_vec();
    record.redo(page)?;
    let after = page.to_vec();
    record.undo(page)?;
    assert_eq!(before, page, "undo of {record:?} is not exact");
    record.redo(page)?;
    assert_eq!(after, page, "redo of {record:?} is not repeatable");

    let bytes = serialize(record);
    let decoded = RecordRegistry::builtin().deserialize(&bytes)?;
    assert_eq!(decoded.record_type(), record.record_type());
    assert_eq!(decoded.page(), Some(KEY));
    assert_eq!(serialize(decoded.as_ref()), bytes);
    Ok(())
}

fn run_cluster(ops: Vec<ClusterOp>) -> Result<()> {
    let mut page = vec![0u8; PAGE_SIZE];
    apply_checked(&ClusterInit::new(KEY), &mut page)?;
    let mut model: Vec<Option<(i32, Vec<u8>)>> = Vec::new();
    let pick = |model: &Vec<Option<(i32, Vec<u8>)>>, raw: usize, live: bool| {
        let candidates: Vec<usize> = (0..model.len())
            .filter(|&i| model[i].is_some() == live)
            .collect();
        (!candidates.is_empty()).then(|| candidates[raw % candidates.len()])
    };

    for op in ops {
        match op {
            ClusterOp::Append(version, content) => {
                let record = AppendRecord::new(KEY, &page, version, content.clone())?;
                apply_checked(&record, &mut page)?;
                model.push(Some((version, content)));
            }
            ClusterOp::Replace(raw, version, content) => {
                let Some(slot) = pick(&model, raw, true) else { continue };
                let record = ReplaceRecord::capture(KEY, &page, slot as u32, version, content.clone())?;
                apply_checked(&record, &mut page)?;
                model[slot] = Some((version, content));
            }
            ClusterOp::Delete(raw) => {
                let Some(slot) = pick(&model, raw, true) else { continue };
                let record = DeleteRecord::capture(KEY, &page, slot as u32)?;
                apply_checked(&record, &mut page)?;
                model[slot] = None;
            }
            ClusterOp::Recycle(raw, version, content) => {
                let Some(slot) = pick(&model, raw, false) else { continue };
                let record = RecycleRecord::capture(KEY, &page, slot as u32, version, content.clone())?;
                apply_checked(&record, &mut page)?;
                model[slot] = Some((version, content));
            }
        }
    }

    let view = ClusterView::new(&page)?;
    assert_eq!(view.slot_count()? as usize, model.len());
    for (slot, expected) in model.iter().enumerate() {
        let actual = view.record(slot as u32)?.map(|(v, c)| (v, c.to_vec()));
        assert_eq!(&actual, expected, "slot {slot}");
    }
    Ok(())
}

fn run_bucket(ops: Vec<BucketOp>) -> Result<()> {
    let mut page = vec![0u8; PAGE_SIZE];
    apply_checked(&BucketInit::new(KEY, true), &mut page)?;
    let mut model: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();

    for op in ops {
        match op {
            BucketOp::Insert(raw, key, value) => {
                let index = raw % (model.len() + 1);
                let record = AddLeafEntry::new(KEY, index as u32, key.clone(), value.clone());
                apply_checked(&record, &mut page)?;
                model.insert(index, (key, value));
            }
            BucketOp::Remove(raw) => {
                if model.is_empty() {
                    continue;
                }
                let index = raw % model.len();
                let record = RemoveLeafEntry::capture(KEY, &page, index as u32)?;
                apply_checked(&record, &mut page)?;
                model.remove(index);
            }
            BucketOp::Update(raw, value) => {
                if model.is_empty() {
                    continue;
                }
                let index = raw % model.len();
                let record = UpdateValue::capture(KEY, &page, index as u32, value.clone())?;
                apply_checked(&record, &mut page)?;
                model[index].1 = value;
            }
        }
    }

    let view = BucketView::new(&page)?;
    assert_eq!(view.len()? as usize, model.len());
    for (index, (key, value)) in model.iter().enumerate() {
        let (k, v) = view.leaf_entry(index as u32)?;
        assert_eq!((k, v), (key.as_slice(), value.as_slice()));
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn cluster_records_undo_exactly(ops in prop::collection::vec(cluster_op(), 1..32)) {
        run_cluster(ops).expect("cluster sequence");
    }

    #[test]
    fn bucket_records_undo_exactly(ops in prop::collection::vec(bucket_op(), 1..32)) {
        run_bucket(ops).expect("bucket sequence");
    }
}

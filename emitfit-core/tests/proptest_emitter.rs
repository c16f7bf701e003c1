//! Property-based tests for detection set aggregation using proptest.

use proptest::prelude::*;

use emitfit_core::{DetectionRecord, DetectionSet};

fn arb_set(max_frame: usize) -> impl Strategy<Value = DetectionSet> {
    prop::collection::vec((0..max_frame, -10.0f32..10.0, 0.0f32..1e4), 0..12).prop_map(
        |records| {
            let records = records
                .into_iter()
                .map(|(frame, x, photons)| DetectionRecord::new(frame, [x, 0.0, 0.0], photons, 1.0))
                .collect();
            DetectionSet::new(records, 3)
        },
    )
}

proptest! {
    #[test]
    fn concat_preserves_total_count(
        sets in prop::collection::vec(arb_set(4), 0..8),
        step in 1usize..16,
    ) {
        let merged = DetectionSet::concat(&sets, step).unwrap();
        let expected: usize = sets.iter().map(DetectionSet::len).sum();
        prop_assert_eq!(merged.len(), expected);
    }

    #[test]
    fn concat_offsets_each_record_by_position(
        sets in prop::collection::vec(arb_set(4), 1..8),
        step in 1usize..16,
    ) {
        let merged = DetectionSet::concat(&sets, step).unwrap();
        let mut out = merged.iter();
        for (i, set) in sets.iter().enumerate() {
            for record in set {
                let merged_record = out.next().unwrap();
                prop_assert_eq!(merged_record.frame, record.frame + i * step);
                prop_assert_eq!(merged_record.xyz, record.xyz);
                prop_assert_eq!(merged_record.photons, record.photons);
            }
        }
        prop_assert!(out.next().is_none());
    }

    #[test]
    fn concat_is_associative_after_reindexing(
        a in arb_set(4),
        b in arb_set(4),
        c in arb_set(4),
        step in 4usize..16,
    ) {
        let flat = DetectionSet::concat(&[a.clone(), b.clone(), c.clone()], step).unwrap();
        let head = DetectionSet::concat(&[a, b], step).unwrap();
        // `head` occupies a single position, so `c` must carry the extra offset itself.
        let nested = DetectionSet::concat(&[head, c.shifted(step)], step).unwrap();
        prop_assert_eq!(flat.records(), nested.records());
    }

    #[test]
    fn source_sample_is_recoverable(
        sets in prop::collection::vec(arb_set(4), 1..8),
        step in 4usize..16,
    ) {
        let merged = DetectionSet::concat(&sets, step).unwrap();
        let mut expected = Vec::new();
        for (i, set) in sets.iter().enumerate() {
            expected.extend(std::iter::repeat_n(i, set.len()));
        }
        let sources: Vec<usize> = merged.iter().map(|r| r.source_sample(step)).collect();
        prop_assert_eq!(sources, expected);
    }
}

#[test]
fn three_samples_with_two_zero_and_five_records() {
    let sizes = [2usize, 0, 5];
    let sets: Vec<DetectionSet> = sizes
        .iter()
        .map(|&n| {
            DetectionSet::new(
                (0..n)
                    .map(|i| DetectionRecord::new(0, [i as f32, 0.0, 0.0], 1000.0, 1.0))
                    .collect(),
                3,
            )
        })
        .collect();

    let merged = DetectionSet::concat(&sets, 1).unwrap();
    assert_eq!(merged.len(), 7);
    assert_eq!(merged.frames(), vec![0, 0, 2, 2, 2, 2, 2]);
    assert_eq!(merged.on_frame(1).count(), 0);
}

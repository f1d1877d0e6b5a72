//! Property-based tests for the change-set algebra

use proptest::prelude::*;
use xie_core::{ChangeSet, CharUnit, ChangeSetError, Item};

fn arb_unit() -> impl Strategy<Value = CharUnit> {
    (
        prop::sample::select(vec!['a', 'b', 'x', 'z', '狗', '时', ',', '\\', '7', '\n']),
        prop::sample::select(vec!["", "gou3", "shi2", ",", "a\\b"]),
    )
        .prop_map(|(glyph, reading)| CharUnit::with_reading(glyph.to_string(), reading).unwrap())
}

fn arb_text(len: usize) -> impl Strategy<Value = Vec<CharUnit>> {
    prop::collection::vec(arb_unit(), len)
}

/// Any valid change set over a text of length `len`.
fn arb_change(len: usize) -> impl Strategy<Value = ChangeSet> {
    (
        prop::collection::vec(any::<bool>(), len),
        prop::collection::vec(prop::collection::vec(arb_unit(), 0..3), len + 1),
    )
        .prop_map(move |(keep, inserts)| {
            let mut builder = ChangeSet::builder(len);
            for (gap, units) in inserts.into_iter().enumerate() {
                for unit in units {
                    builder = builder.insert(unit);
                }
                if gap < len && keep[gap] {
                    builder = builder.keep(gap);
                }
            }
            builder.build().unwrap()
        })
}

/// A text with two concurrent change sets against it.
fn arb_concurrent() -> impl Strategy<Value = (Vec<CharUnit>, ChangeSet, ChangeSet)> {
    (0..7usize).prop_flat_map(|len| (arb_text(len), arb_change(len), arb_change(len)))
}

/// A text with two sequential change sets.
fn arb_sequential() -> impl Strategy<Value = (Vec<CharUnit>, ChangeSet, ChangeSet)> {
    (0..7usize)
        .prop_flat_map(|len| (arb_text(len), arb_change(len)))
        .prop_flat_map(|(text, a)| {
            let after = a.length_after();
            (Just(text), Just(a), arb_change(after))
        })
}

proptest! {
    #[test]
    fn prop_compose_matches_sequential_apply((text, a, b) in arb_sequential()) {
        let stepwise = b.apply(&a.apply(&text).unwrap()).unwrap();
        let composed = a.compose(&b).unwrap();
        prop_assert!(composed.is_valid());
        prop_assert_eq!(composed.apply(&text).unwrap(), stepwise);
    }

    #[test]
    fn prop_merge_is_commutative((_text, a, b) in arb_concurrent()) {
        let ab = a.merge(&b).unwrap();
        let ba = b.merge(&a).unwrap();
        prop_assert!(ab.is_valid());
        prop_assert_eq!(ab, ba);
    }

    #[test]
    fn prop_follow_converges((text, a, b) in arb_concurrent()) {
        let a_follow_b = a.follow(&b).unwrap();
        let b_follow_a = b.follow(&a).unwrap();
        prop_assert!(a_follow_b.is_valid());
        prop_assert!(b_follow_a.is_valid());

        let via_a = a_follow_b.apply(&a.apply(&text).unwrap()).unwrap();
        let via_b = b_follow_a.apply(&b.apply(&text).unwrap()).unwrap();
        prop_assert_eq!(via_a, via_b);
    }

    #[test]
    fn prop_follow_of_identity_is_other_side((_text, a, _b) in arb_concurrent()) {
        let ident = ChangeSet::identity(a.length_before());
        prop_assert_eq!(ident.follow(&a).unwrap(), a.clone());
        prop_assert!(a.follow(&ident).unwrap().is_identity());
    }

    #[test]
    fn prop_diag_string_roundtrip((_text, a, _b) in arb_concurrent()) {
        let parsed: ChangeSet = a.to_diag_string().parse().unwrap();
        prop_assert_eq!(parsed, a);
    }

    #[test]
    fn prop_json_roundtrip((_text, a, _b) in arb_concurrent()) {
        let decoded = ChangeSet::from_json(&a.to_json().unwrap()).unwrap();
        prop_assert!(decoded.is_valid());
        prop_assert_eq!(decoded, a);
    }

    #[test]
    fn prop_forward_positions_stay_in_bounds((_text, a, _b) in arb_concurrent()) {
        let mut positions: Vec<usize> = (0..=a.length_before()).collect();
        a.forward_positions(&mut positions);
        prop_assert!(positions.iter().all(|p| *p <= a.length_after()));
        prop_assert!(positions.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn prop_validate_rejects_swapped_kept(len in 2..8usize, first in 0..6usize) {
        let first = first % (len - 1);
        let json = format!(
            r#"{{"lengthBefore":{len},"lengthAfter":2,"items":[{},{first}]}}"#,
            first + 1
        );
        let decoded = ChangeSet::from_json(&json).unwrap();
        prop_assert_eq!(
            decoded.validate(),
            Err(ChangeSetError::KeptOutOfOrder { previous: first + 1, index: first })
        );
    }
}

#[test]
fn test_items_are_tagged_by_shape() {
    let decoded = ChangeSet::from_json(
        r#"{"lengthBefore":2,"lengthAfter":2,"items":[1,{"glyph":"时","reading":"shi2"}]}"#,
    )
    .unwrap();
    assert_eq!(decoded.items()[0], Item::Kept(1));
    assert_eq!(
        decoded.items()[1],
        Item::Inserted(CharUnit::with_reading("时", "shi2").unwrap())
    );
}

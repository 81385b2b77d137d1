//! Properties of the canonical encoder.

use orbit_core::{from_slice, to_vec, Canon};
use proptest::prelude::*;

proptest! {
    #[test]
    fn same_fields_always_produce_the_same_image(
        n in any::<u64>(),
        s in ".*",
        bytes in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let a = Canon::new("orbit-prop").u64(n).str(&s).bytes(&bytes).finish();
        let b = Canon::new("orbit-prop").u64(n).str(&s).bytes(&bytes).finish();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn moving_a_byte_across_a_field_boundary_changes_the_image(
        left in proptest::collection::vec(any::<u8>(), 1..64),
        right in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        // ("ab", "c") vs ("a", "bc"): shifting the boundary must never
        // collide, or signatures could be replayed across fields.
        let mut shifted_left = left.clone();
        let moved = shifted_left.pop().unwrap();
        let mut shifted_right = vec![moved];
        shifted_right.extend_from_slice(&right);

        let a = Canon::new("orbit-prop").bytes(&left).bytes(&right).finish();
        let b = Canon::new("orbit-prop").bytes(&shifted_left).bytes(&shifted_right).finish();
        prop_assert_ne!(a, b);
    }

    #[test]
    fn wire_round_trip(
        pairs in proptest::collection::vec((".*", proptest::collection::vec(any::<u8>(), 0..32)), 0..8),
    ) {
        let bytes = to_vec(&pairs).unwrap();
        let back: Vec<(String, Vec<u8>)> = from_slice(&bytes).unwrap();
        prop_assert_eq!(pairs, back);
    }
}

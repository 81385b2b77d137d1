//! Round-trip and digest properties of records and manifests.

use orbit_core::{RecordId, ZoneId};
use orbit_keys::ZoneKey;
use orbit_records::SecretRecord;
use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

proptest! {
    #[test]
    fn encrypt_decrypt_round_trips_for_all_plaintexts(
        plaintext in proptest::collection::vec(any::<u8>(), 0..2048),
        seed in any::<u64>(),
    ) {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let key = ZoneKey::generate(ZoneId::new("passwords"), 1, &mut rng);
        let record =
            SecretRecord::encrypt(&plaintext, &key, RecordId::new(), 1, &mut rng).unwrap();
        prop_assert_eq!(record.decrypt(&key).unwrap(), plaintext);
    }

    #[test]
    fn decrypting_under_a_rotated_key_always_fails(
        plaintext in proptest::collection::vec(any::<u8>(), 0..512),
        seed in any::<u64>(),
    ) {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let key = ZoneKey::generate(ZoneId::new("passwords"), 1, &mut rng);
        let rotated = key.rotated(&mut rng);
        let record =
            SecretRecord::encrypt(&plaintext, &key, RecordId::new(), 1, &mut rng).unwrap();
        prop_assert!(record.decrypt(&rotated).is_err());
    }

    #[test]
    fn record_hash_is_stable_across_clones(
        plaintext in proptest::collection::vec(any::<u8>(), 0..512),
        seed in any::<u64>(),
    ) {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let key = ZoneKey::generate(ZoneId::new("passwords"), 1, &mut rng);
        let record =
            SecretRecord::encrypt(&plaintext, &key, RecordId::new(), 1, &mut rng).unwrap();
        prop_assert_eq!(record.record_hash(), record.clone().record_hash());
    }
}

//! Decoder laws over generated blobs
//!
//! Any blob the decoder accepts rebuilds into the same license bytes, and no
//! input makes it panic.

mod helpers;

use helpers::blob;
use kindlepass::crypto::{build_license_file, decode, extract_activation_bytes, ActivationBlob};
use proptest::prelude::*;

/// Groups other than the activation key, which may repeat
fn other_group() -> impl Strategy<Value = (u16, Vec<u8>)> {
    (
        prop::sample::select(vec![0x01u16, 0x02, 0x03, 0x04, 0x05, 0x06, 0x08]),
        prop::collection::vec(any::<u8>(), 0..64),
    )
}

/// Framed blob with exactly one key group somewhere among the others
fn valid_blob() -> impl Strategy<Value = (Vec<u8>, [u8; 4], usize)> {
    (
        prop::collection::vec(other_group(), 0..8),
        any::<[u8; 4]>(),
        any::<prop::sample::Index>(),
        0usize..32,
    )
        .prop_map(|(mut groups, key, position, padding)| {
            let at = position.index(groups.len() + 1);
            groups.insert(at, (0x07, key.to_vec()));
            let framed: Vec<(u16, &[u8])> = groups.iter().map(|(tag, payload)| (*tag, payload.as_slice())).collect();
            (blob(&framed, padding), key, padding)
        })
}

proptest! {
    #[test]
    fn test_accepted_blobs_round_trip((bytes, key, padding) in valid_blob()) {
        let record = decode(&ActivationBlob::new(bytes.clone())).unwrap();
        let license = build_license_file(&record);
        prop_assert_eq!(license.as_bytes(), &bytes[..bytes.len() - padding]);

        let activation = extract_activation_bytes(&record).unwrap();
        let mut reversed = key;
        reversed.reverse();
        prop_assert_eq!(activation.as_bytes(), &reversed);
    }

    #[test]
    fn test_arbitrary_input_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode(&ActivationBlob::new(bytes));
    }

    #[test]
    fn test_arbitrary_group_section_never_panics(
        section in prop::collection::vec(any::<u8>(), 0..128),
        padding in prop::collection::vec(any::<u8>(), 0..16),
    ) {
        // Consistent header, random groups: exercises the group walk rather than the header check
        let mut bytes = (section.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(&section);
        bytes.extend_from_slice(&padding);

        if let Ok(record) = decode(&ActivationBlob::new(bytes.clone())) {
            let license = build_license_file(&record);
            prop_assert_eq!(license.as_bytes(), &bytes[..4 + section.len()]);
        }
    }
}

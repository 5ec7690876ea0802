//! Property-based tests for placement decisions.

use proptest::prelude::*;
use rill_client::Mash;
use rill_client::Uuid;
use rill_client_api::MashDescription;
use rill_client_api::MashMember;

const PLACEMENT_SPACE: u64 = 1 << 32;

/// A mash whose members split the placement space evenly, all up.
fn even_mash(count: u32) -> Mash {
    let count = u64::from(count);
    let members = (0..count)
        .map(|index| MashMember {
            hash: index as u32 + 1,
            start: index * PLACEMENT_SPACE / count,
            end: (index + 1) * PLACEMENT_SPACE / count,
            up: true,
            addresses: vec![format!("10.0.0.{index}:4410")],
        })
        .collect();
    Mash::from_description(MashDescription { revision: 1, members })
}

proptest! {
    #[test]
    fn placement_is_deterministic_and_total(bytes in any::<[u8; 16]>(), count in 1u32..9) {
        let mash = even_mash(count);
        let id = Uuid::from_bytes(bytes);
        let first = mash.endpoint_for(&id).map(|(hash, _)| hash);
        let second = mash.endpoint_for(&id).map(|(hash, _)| hash);
        prop_assert_eq!(first, second);
        // Full coverage with every member up: every id is mapped.
        prop_assert!(first.is_some());
    }

    #[test]
    fn owner_slice_contains_the_placement_key(bytes in any::<[u8; 16]>(), count in 1u32..9) {
        let mash = even_mash(count);
        let id = Uuid::from_bytes(bytes);
        let key = u64::from(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
        let (hash, addresses) = mash.endpoint_for(&id).expect("mapped");
        let member = mash.members().find(|member| member.hash == hash).expect("member");
        prop_assert!(member.start <= key && key < member.end);
        prop_assert_eq!(addresses, member.addresses.as_slice());
    }
}

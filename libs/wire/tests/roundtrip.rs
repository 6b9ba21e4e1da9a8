//! Property tests for codec round-trips.
//!
//! Any structure built from valid inputs must survive encode→decode with
//! every non-reserved field intact, and reserved bytes must always be zero
//! after encode.

use proptest::prelude::*;

use vif_wire::{
    decode_snapshot, BridgeMemberRecord, FakeRequest, InterfaceName, MediaDescriptor, MemberFlags,
    StpRole, StpState, BRIDGE_MEMBER_RECORD_LEN, MEDIA_LIST_MAX,
};

fn ifname_strategy() -> impl Strategy<Value = InterfaceName> {
    "[a-z][a-z0-9]{0,14}".prop_map(|s| InterfaceName::new(&s).unwrap())
}

fn record_strategy() -> impl Strategy<Value = BridgeMemberRecord> {
    (
        ifname_strategy(),
        any::<u32>(),
        any::<u32>(),
        any::<u32>(),
        any::<[u8; 5]>(),
        any::<(u32, u32, u32)>(),
    )
        .prop_map(|(name, flags, stp_flags, path_cost, bytes, counters)| {
            BridgeMemberRecord {
                name,
                flags: MemberFlags::from_bits(flags),
                stp_flags,
                path_cost,
                port_no: bytes[0],
                priority: bytes[1],
                proto: bytes[2],
                role: StpRole::from_raw(bytes[3]),
                state: StpState::from_raw(bytes[4]),
                addr_count: counters.0,
                addr_max: counters.1,
                addr_exceeded: counters.2,
            }
        })
}

proptest! {
    #[test]
    fn bridge_record_round_trips(record in record_strategy()) {
        let buf = record.encode();
        prop_assert!(buf[48..].iter().all(|&b| b == 0));
        prop_assert_eq!(BridgeMemberRecord::decode(&buf).unwrap(), record);
    }

    #[test]
    fn snapshot_round_trips(records in prop::collection::vec(record_strategy(), 0..8)) {
        let mut buf = Vec::with_capacity(records.len() * BRIDGE_MEMBER_RECORD_LEN);
        for record in &records {
            buf.extend_from_slice(&record.encode());
        }
        prop_assert_eq!(decode_snapshot(&buf).unwrap(), records);
    }

    #[test]
    fn interface_name_round_trips(name in ifname_strategy()) {
        let mut field = [0u8; 16];
        name.encode_into(&mut field).unwrap();
        prop_assert_eq!(InterfaceName::decode(&field).unwrap(), name);
    }

    #[test]
    fn overlong_names_never_truncate(s in "[a-z]{16,40}") {
        prop_assert!(InterfaceName::new(&s).is_err());
    }

    #[test]
    fn media_round_trips(
        current in any::<i32>(),
        list in prop::collection::vec(any::<i32>(), 0..=MEDIA_LIST_MAX),
    ) {
        let media = MediaDescriptor::new(current, list).unwrap();
        let request = FakeRequest::SetMedia(media);
        let buf = request.encode();
        prop_assert!(buf[..32].iter().all(|&b| b == 0));
        prop_assert_eq!(FakeRequest::decode(request.command(), &buf).unwrap(), request);
    }

    #[test]
    fn peer_request_round_trips(peer in ifname_strategy()) {
        let request = FakeRequest::SetPeer(peer);
        let buf = request.encode();
        prop_assert_eq!(FakeRequest::decode(request.command(), &buf).unwrap(), request);
    }
}

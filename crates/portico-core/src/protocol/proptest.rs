//! Property-based tests for the frame codec and message shapes.

#![cfg(test)]

use bytes::BytesMut;
use proptest::prelude::*;

use crate::protocol::messages::{
    ConnectionTypeRequest, DesiredConnectionType, ExtensionHostParams, HandshakeMessage,
};
use crate::protocol::{Frame, FrameCodec};

prop_compose! {
    fn arb_ext_host_params()(
        language in proptest::option::of("[a-z]{2}"),
        port in proptest::option::of(1024u16..),
        debug_id in proptest::option::of("[a-z0-9-]{1,16}"),
        break_on_start in any::<bool>(),
    ) -> ExtensionHostParams {
        ExtensionHostParams { language, port, debug_id, break_on_start }
    }
}

proptest! {
    #[test]
    fn frame_roundtrip(seq in any::<u64>(), payload in prop::collection::vec(any::<u8>(), 0..4096)) {
        let encoded = FrameCodec::encode(seq, &payload).unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        let frame = FrameCodec::decode(&mut buf).unwrap().unwrap();
        prop_assert_eq!(frame, Frame { seq, payload: payload.into() });
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn decode_never_panics_on_arbitrary_input(data in prop::collection::vec(any::<u8>(), 0..2048)) {
        let mut buf = BytesMut::from(&data[..]);
        // Errors are fine; panics are not.
        let _ = FrameCodec::decode(&mut buf);
    }

    #[test]
    fn truncated_frames_never_consume(seq in any::<u64>(), payload in prop::collection::vec(any::<u8>(), 1..512)) {
        let encoded = FrameCodec::encode(seq, &payload).unwrap();
        for cut in 0..encoded.len() {
            let mut buf = BytesMut::from(&encoded[..cut]);
            prop_assert!(FrameCodec::decode(&mut buf).unwrap().is_none());
            prop_assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn connection_type_json_roundtrip(
        signed_data in "[ -~]{0,64}",
        commit in proptest::option::of("[0-9a-f]{40}"),
        is_built in any::<bool>(),
        params in arb_ext_host_params(),
    ) {
        let msg = HandshakeMessage::ConnectionType(ConnectionTypeRequest {
            signed_data,
            commit,
            is_built,
            desired_connection_type: DesiredConnectionType::ExtensionHost,
            args: Some(serde_json::to_value(&params).unwrap()),
        });
        let json = serde_json::to_string(&msg).unwrap();
        let back: HandshakeMessage = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back, msg);
    }
}

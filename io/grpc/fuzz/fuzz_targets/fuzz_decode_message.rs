#![no_main]

use bytes::BytesMut;
use grpc::{FrameError, decode_message, encode_frame};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);

    while let Ok(Some(frame)) = decode_message(&mut buf, Some(1 << 20)) {
        assert!(frame.len() <= 1 << 20);

        let mut reencoded = BytesMut::new();
        encode_frame(frame.compressed, &frame.payload, &mut reencoded)
            .expect("decoded frame must re-encode");

        let again = decode_message(&mut reencoded, None)
            .expect("re-encoded frame must decode")
            .expect("re-encoded frame must be complete");
        assert_eq!(frame, again);
        assert!(reencoded.is_empty());
    }

    // Header-level faults are the only ones the raw decoder reports.
    if let Err(e) = decode_message(&mut buf, Some(1 << 20)) {
        assert!(matches!(
            e,
            FrameError::TooLarge { .. } | FrameError::ReceiveLimitExceeded { .. }
        ));
        let _ = grpc::Status::from(e);
    }
});

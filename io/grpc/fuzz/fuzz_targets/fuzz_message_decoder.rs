#![no_main]

use grpc::MessageDecoder;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    // First byte picks the chunking so split headers get exercised.
    let chunk_size = usize::from(data[0]).max(1);
    let mut decoder = MessageDecoder::with_max_message_size(Some(64 * 1024));
    let mut consumed = 0usize;

    for chunk in data[1..].chunks(chunk_size) {
        decoder.feed(chunk);
        loop {
            match decoder.decode() {
                Ok(Some(frame)) => consumed += grpc::frame::HEADER_SIZE + frame.len(),
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }

    assert_eq!(consumed + decoder.buffered_len(), data.len() - 1);
    assert_eq!(decoder.finish().is_ok(), !decoder.has_buffered_data());
});

//! Fuzz target for the inbound packet path.
//!
//! Feeds arbitrary bytes, split at an arbitrary point, to a plaintext
//! `PacketDecoder` and decodes every packet it yields. The decoder must
//! return errors, never panic, and never hand out a packet above the
//! configured maximum.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use strand_proto::ssh::codec::PacketDecoder;
use strand_proto::ssh::packet::MAX_PACKET_SIZE;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let split = data[0] as usize % data.len();
    let (first, second) = data[1..].split_at(split.min(data.len() - 1));

    let mut decoder = PacketDecoder::new(MAX_PACKET_SIZE);
    for chunk in [first, second] {
        decoder.feed(chunk);
        loop {
            match decoder.decode() {
                Ok(Some(packet)) => assert!(packet.payload().len() <= MAX_PACKET_SIZE),
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
});

#![no_main]

use dysect_core::packet::Packet;
use libfuzzer_sys::fuzz_target;

// The overlay feeds untrusted bytes straight into the decoder; it must
// reject malformed input without panicking, and anything it accepts
// must re-encode to a stable canonical form. Bytes are compared rather
// than packets so NaN-valued float payloads stay bit-exact.
fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::decode(data) {
        let bytes = packet.encode();
        let again = Packet::decode(&bytes).expect("re-decode of encoded packet");
        assert_eq!(again.encode(), bytes);
    }
});

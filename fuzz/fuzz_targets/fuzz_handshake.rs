#![no_main]

use mysql_broker::protocol::decode::{decode_auth_reply, decode_err, decode_handshake};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(greeting) = decode_handshake(data) {
        let _ = greeting.scramble.len();
        let _ = decode_auth_reply(data, greeting.capabilities);
    }
    let _ = decode_auth_reply(data, 0);
    let _ = decode_err(data);
});

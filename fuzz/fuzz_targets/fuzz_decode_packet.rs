#![no_main]

use bytes::BytesMut;
use mysql_broker::protocol::decode::{decode_query_reply, decode_text_row, is_continued};
use mysql_broker::protocol::decode_packet;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);

    // Several packets may arrive in a single TCP segment.
    loop {
        if buf.is_empty() {
            break;
        }
        match decode_packet(&buf) {
            Ok((packet, consumed)) => {
                if consumed == 0 {
                    break;
                }
                let _ = is_continued(packet.payload.len());
                let _ = decode_query_reply(&packet.payload, u32::MAX);
                let _ = decode_text_row(&packet.payload, 4);
                let _ = buf.split_to(consumed);
            }
            Err(_) => break,
        }
    }
});

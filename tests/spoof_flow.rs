//! End-to-end cookie spoofing: store, decoy, client handshake, rewrite.

use std::io::Read;
use std::sync::Arc;
use std::thread;

use xcookie_proxy::{
    encode_setup_packet, read_and_rewrite_setup, ByteOrder, Display, DisplayRange,
    MemoryAuthority, XAuthEntry, XAuthError, XAuthority,
};

fn store_with_entry(display: &Display) -> MemoryAuthority {
    let store = MemoryAuthority::new();
    store.add_entry(&XAuthEntry::new_random(display.clone())).unwrap();
    store
}

#[test]
fn test_decoy_handshake_reaches_server_with_real_cookie() {
    let display = Display::parse_in("unix:10", DisplayRange::forwarding(10, 1000).unwrap()).unwrap();
    let store = store_with_entry(&display);

    let real = store.read_entry(&display).unwrap();
    let decoy = real.decoy();
    assert_ne!(decoy.cookie(), real.cookie());

    for order in [ByteOrder::LittleEndian, ByteOrder::BigEndian] {
        let from_client = encode_setup_packet(&decoy, order).unwrap();
        let to_server = read_and_rewrite_setup(&mut &from_client[..], &decoy, &real).unwrap();

        assert_eq!(to_server, encode_setup_packet(&real, order).unwrap());
        assert!(!to_server
            .windows(decoy.cookie_bytes().unwrap().len())
            .any(|w| w == &decoy.cookie_bytes().unwrap()[..]));
    }
}

#[test]
fn test_stale_decoy_after_regeneration_is_denied() {
    let display = Display::unix(12);
    let store = store_with_entry(&display);

    let real = store.read_entry(&display).unwrap();
    let old_decoy = real.decoy();
    let new_decoy = real.decoy();

    let packet = encode_setup_packet(&old_decoy, ByteOrder::LittleEndian).unwrap();
    let err = read_and_rewrite_setup(&mut &packet[..], &new_decoy, &real).unwrap_err();
    assert!(matches!(err, XAuthError::AccessDenied(_)));
    assert!(err.closes_connection());
}

#[test]
fn test_trailing_requests_stay_in_stream() {
    let display = Display::unix(10);
    let real = XAuthEntry::new_random(display);
    let decoy = real.decoy();

    let mut stream = encode_setup_packet(&decoy, ByteOrder::LittleEndian).unwrap();
    stream.extend_from_slice(b"first request");

    let mut reader = &stream[..];
    read_and_rewrite_setup(&mut reader, &decoy, &real).unwrap();

    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).unwrap();
    assert_eq!(rest, b"first request");
}

#[test]
fn test_parallel_rewrites_share_one_pair() {
    let real = Arc::new(XAuthEntry::new_random(Display::unix(10)));
    let decoy = Arc::new(real.decoy());
    let expected = encode_setup_packet(&real, ByteOrder::BigEndian).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let real = Arc::clone(&real);
            let decoy = Arc::clone(&decoy);
            thread::spawn(move || {
                let presented = if i % 2 == 0 {
                    (*decoy).clone()
                } else {
                    XAuthEntry::new_random(Display::unix(10))
                };
                let packet = encode_setup_packet(&presented, ByteOrder::BigEndian).unwrap();
                (i, read_and_rewrite_setup(&mut &packet[..], &decoy, &real))
            })
        })
        .collect();

    for handle in handles {
        let (i, result) = handle.join().unwrap();
        if i % 2 == 0 {
            assert_eq!(result.unwrap(), expected);
        } else {
            assert!(matches!(result, Err(XAuthError::AccessDenied(_))));
        }
    }
}

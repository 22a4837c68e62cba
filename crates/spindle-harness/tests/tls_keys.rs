//! TLS key lifecycle at full capacity (own process: the key table is
//! global and this suite sweeps all of it).

use spindle_core::errno::ENOMEM;
use spindle_core::tls::{self, MAX_KEYS};
use spindle_harness::ensure_runtime;

#[test]
fn full_key_table_cycles_cleanly() {
    ensure_runtime();

    // Claim every key.
    let mut keys = Vec::with_capacity(MAX_KEYS);
    for _ in 0..MAX_KEYS {
        keys.push(tls::key_create(None).expect("table should have room"));
    }
    assert_eq!(tls::key_create(None), Err(ENOMEM));

    // Release every key; the table must be fully reusable afterwards —
    // generation parity is back to "free" for every slot.
    for key in keys {
        tls::key_delete(key).unwrap();
    }
    let again = tls::key_create(None).expect("freed table should have room");
    tls::setspecific(again, 1).unwrap();
    assert_eq!(tls::getspecific(again), 1);
    tls::key_delete(again).unwrap();
}

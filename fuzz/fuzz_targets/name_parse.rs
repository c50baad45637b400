//! Fuzzer for node-name parsing.
//!
//! Parsing is the gate in front of every listen and connect: it must
//! never panic, and accepted names must round-trip into consistent
//! parts under both naming modes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_core::name::{NamingMode, NodeName};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    for mode in [NamingMode::Short, NamingMode::Long] {
        // INVARIANT 1: parsing never panics, for any input
        let Ok(name) = NodeName::parse(input, mode) else {
            continue;
        };

        // INVARIANT 2: accepted names reassemble exactly
        assert_eq!(format!("{}@{}", name.alive(), name.host()), input);

        // INVARIANT 3: accepted names are stable under re-parsing
        let again = NodeName::parse(name.as_str(), mode).expect("accepted name must re-parse");
        assert_eq!(again.alive(), name.alive());
        assert_eq!(again.host(), name.host());

        // INVARIANT 4: the separator is unique in accepted names
        assert_eq!(name.as_str().matches('@').count(), 1);
    }
});

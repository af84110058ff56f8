#![no_main]

//! Fuzz target for the redelivery-handling grammar.
//!
//! Action tables arrive from configuration files and from message properties
//! set by endpoint callbacks, so the parser sees arbitrary text. It must never
//! panic, and any table it accepts must be usable by the tracker.

use libfuzzer_sys::fuzz_target;
use sluice_core::Destination;
use sluice_delivery::poison::ActionTable;

fuzz_target!(|data: &[u8]| {
    let Ok(spec) = std::str::from_utf8(data) else {
        return;
    };
    fuzz_action_table(spec);
});

fn fuzz_action_table(spec: &str) {
    let origin = Destination::queue("Orders");
    let Ok(table) = ActionTable::parse(spec, &origin) else {
        return;
    };

    assert!(!table.is_empty());
    assert_eq!(table.entry(0).threshold, 1);
    for pair in table.entries().windows(2) {
        assert!(pair[0].threshold < pair[1].threshold);
        assert!(!pair[0].action.is_terminal());
    }

    // Walking the cursor over many encounters stays inside the table.
    let mut cursor = 0;
    for encounter in 1..=64 {
        cursor = table.advance(cursor, encounter);
        assert!(cursor < table.len());
    }

    // The rendered form parses back to the same table.
    let rendered = table.to_string();
    match ActionTable::parse(&rendered, &origin) {
        Ok(reparsed) => assert_eq!(reparsed, table),
        Err(e) => panic!("rendered table {rendered:?} does not parse: {e}"),
    }
}

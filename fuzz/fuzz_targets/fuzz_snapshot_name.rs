//! Fuzz target for naming schema compilation and snapshot name parsing.
//!
//! Schemas built from arbitrary templates must either be rejected or
//! round-trip their own names; parsing arbitrary names must never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use snapshot_replication::NamingSchema;

fuzz_target!(|data: (&str, &str)| {
    let (template, name) = data;

    let default = NamingSchema::new("auto-%Y-%m-%d_%H-%M").expect("default schema");
    let _ = default.parse(name);

    // Should never panic
    let Ok(schema) = NamingSchema::new(template) else {
        return;
    };
    if let Some(parsed) = schema.parse(name) {
        assert_eq!(parsed.name, name);
        assert!(parsed.datetime.is_some());
    }
});

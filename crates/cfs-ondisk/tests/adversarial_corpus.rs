#![forbid(unsafe_code)]
//! Malformed-input tests for the block codecs.
//!
//! Every parser must turn arbitrary bytes into either a record or a
//! `ParseError`, never a panic. Valid master records also survive the block
//! and JSON encodings unchanged.

use cfs_ondisk::{BlockMapNode, Inode, LinkRecord, MasterRecord};
use cfs_types::{BLOCK_SIZE, CFS_MAGIC, ParseError, write_le_u32};
use proptest::prelude::*;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Offsets of the 32-bit master record fields after the magic.
const MASTER_FIELDS: [usize; 17] = [
    4, 8, 12, 16, 20, 24, 28, 32, 36, 40, 44, 48, 52, 56, 60, 64, 68,
];

fn run_parser<T, F>(parser_name: &'static str, parser: F) -> Option<ParseError>
where
    F: FnOnce() -> Result<T, ParseError>,
{
    match catch_unwind(AssertUnwindSafe(parser)) {
        Ok(Ok(_)) => None,
        Ok(Err(err)) => Some(err),
        Err(panic_payload) => {
            let _ = panic_payload;
            panic!("parser `{parser_name}` panicked");
        }
    }
}

fn parse_everything(block: &[u8]) {
    run_parser("master", || MasterRecord::parse_from_bytes(block));
    run_parser("inode", || Inode::parse_from_bytes(block));
    run_parser("block_map_node", || BlockMapNode::parse_from_bytes(block));
    run_parser("link_record", || LinkRecord::parse_from_bytes(block));
}

// ---------------------------------------------------------------------------
// Fixed corpus
// ---------------------------------------------------------------------------

#[test]
fn master_fields_at_their_limits_are_rejected_without_panicking() {
    let valid = MasterRecord::layout(1, 4096).unwrap().to_block();
    for offset in MASTER_FIELDS {
        for value in [0, 1, u32::MAX - 1, u32::MAX] {
            let mut block = valid;
            write_le_u32(&mut block, offset, value).unwrap();
            parse_everything(&block);
        }
    }
}

#[test]
fn short_and_empty_inputs_report_insufficient_data() {
    for len in [0, 1, 3, 4, 71, 80, 100, BLOCK_SIZE - 1] {
        let bytes = vec![0xFF_u8; len];
        parse_everything(&bytes);
    }
    let err = run_parser("master", || MasterRecord::parse_from_bytes(&[])).unwrap();
    assert!(matches!(err, ParseError::InsufficientData { .. }));
}

#[test]
fn master_record_json_round_trip() {
    let master = MasterRecord::layout(3, 10_000).unwrap();
    let json = serde_json::to_string(&master).unwrap();
    let back: MasterRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(back, master);
    let value = serde_json::to_value(master).unwrap();
    assert_eq!(value["total_blocks"], 10_000);
    assert_eq!(value["block_start"], 3);
}

// ---------------------------------------------------------------------------
// Generated corpus
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn random_blocks_never_panic(mut bytes in prop::collection::vec(any::<u8>(), BLOCK_SIZE)) {
        parse_everything(&bytes);
        // With the magic in place the master parser reaches the geometry checks.
        write_le_u32(&mut bytes, 0, CFS_MAGIC).unwrap();
        parse_everything(&bytes);
    }

    #[test]
    fn mutated_master_records_never_panic(
        total in 64_u32..200_000,
        field in 0_usize..MASTER_FIELDS.len(),
        value in any::<u32>(),
    ) {
        let mut block = MasterRecord::layout(1, total).unwrap().to_block();
        write_le_u32(&mut block, MASTER_FIELDS[field], value).unwrap();
        parse_everything(&block);
    }

    #[test]
    fn layouts_survive_the_block_encoding(start in 1_u32..64, total in 0_u32..500_000) {
        if let Ok(master) = MasterRecord::layout(start, total) {
            prop_assert_eq!(master.data.end.0, total);
            let back = MasterRecord::parse_from_bytes(&master.to_block()).unwrap();
            prop_assert_eq!(back, master);
        }
    }
}

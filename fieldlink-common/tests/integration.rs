//! Integration tests for fieldlink-common library.

use chrono::Local;
use fieldlink_common::{
    BRIDGE_TIMESTAMP_KEY, BrokerConfig, DataBlock, Entry, FieldValue, LoggingConfig,
    parse_config,
};
use serde::Deserialize;

#[test]
fn test_block_from_wire_lines() {
    let now = Local::now();
    let mut entries = vec![Entry::bridge_timestamp(now)];
    for line in ["TEMP:21.5 C", "HUMIDITY:48 %", "PRESSURE:1013.25 hPa", "CPM:17"] {
        entries.push(Entry::parse(line).expect("wire line should parse"));
    }
    let block = DataBlock::new(entries, now);

    assert_eq!(block.len(), 5);
    assert_eq!(block.entries()[0].key, BRIDGE_TIMESTAMP_KEY);
    assert_eq!(block.started_at(), now);

    let map = block.field_map();
    assert_eq!(map["pressure"], serde_json::json!(1013.25));
    assert_eq!(map["cpm"], serde_json::json!(17));
    assert_eq!(
        block.get("CPM").map(Entry::field_value),
        Some(FieldValue::Integer(17))
    );
}

#[test]
fn test_payload_serializes_as_flat_object() {
    let now = Local::now();
    let block = DataBlock::new(
        vec![
            Entry::bridge_timestamp(now),
            Entry::new("TEMP", "21.5 C"),
            Entry::new("STATUS", "warming up"),
        ],
        now,
    );

    let json = serde_json::to_string(&block.field_map()).unwrap();
    assert!(json.contains("\"temp\":21.5"));
    assert!(json.contains("\"status\":\"warming up\""));
    assert!(json.contains("\"rpi_timestamp\":\""));
}

#[test]
fn test_shared_config_sections() {
    #[derive(Deserialize)]
    struct Wrapper {
        broker: BrokerConfig,
        logging: LoggingConfig,
    }

    let wrapper: Wrapper = parse_config(
        r#"{ broker: { mode: "peer", listen: ["tcp/0.0.0.0:7447"] }, logging: { level: "trace" } }"#,
    )
    .unwrap();

    assert_eq!(wrapper.broker.mode, "peer");
    assert_eq!(wrapper.broker.listen, vec!["tcp/0.0.0.0:7447"]);
    assert_eq!(wrapper.logging.level, "trace");
}

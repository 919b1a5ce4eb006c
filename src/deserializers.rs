use serde::de::{self, Visitor};
use serde::Deserializer;
use std::fmt;

/// Parse hex strings (with or without `0x`) to u64 values
pub fn parse_hex(s: &str) -> Result<u64, String> {
    let cleaned = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(cleaned, 16).map_err(|e| format!("'{}' is not a valid hex number: {}", s, e))
}

fn value_to_u64<E: de::Error>(value: serde_json::Value) -> Result<u64, E> {
    match value {
        serde_json::Value::String(s) => parse_hex(&s).map_err(E::custom),
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| E::custom("Invalid number for address")),
        _ => Err(E::custom("Address must be a string or number")),
    }
}

/// Custom deserializer for a list of hex addresses that can handle both strings and numbers
pub fn deserialize_hex<'de, D>(deserializer: D) -> Result<Vec<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct HexAddressesVisitor;

    impl<'de> Visitor<'de> for HexAddressesVisitor {
        type Value = Vec<u64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an array of hex addresses (strings like \"0x123\" or numbers)")
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Vec<u64>, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut addresses = Vec::new();
            while let Some(value) = seq.next_element::<serde_json::Value>()? {
                addresses.push(value_to_u64(value)?);
            }
            Ok(addresses)
        }
    }

    deserializer.deserialize_seq(HexAddressesVisitor)
}

/// Custom deserializer for a single optional hex value (register offsets)
pub fn deserialize_hex_option<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct HexValueVisitor;

    impl<'de> Visitor<'de> for HexValueVisitor {
        type Value = Option<u64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a hex string like \"0x110\" or a number")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Option<u64>, E> {
            Ok(Some(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Option<u64>, E> {
            u64::try_from(v)
                .map(Some)
                .map_err(|_| E::custom("Offset must not be negative"))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Option<u64>, E> {
            parse_hex(v).map(Some).map_err(E::custom)
        }

        fn visit_none<E: de::Error>(self) -> Result<Option<u64>, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Option<u64>, E> {
            Ok(None)
        }
    }

    deserializer.deserialize_any(HexValueVisitor)
}

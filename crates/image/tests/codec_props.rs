//! Property tests for the byte codec

use image::{ByteReader, ByteWriter};
use proptest::prelude::*;

proptest! {
    #[test]
    fn scalar_round_trip(a in any::<u64>(), b in any::<i64>(), c in any::<f64>(), s in ".{0,64}") {
        let mut writer = ByteWriter::new();
        writer.u64(a);
        writer.i64(b);
        writer.f64(c);
        writer.str(&s);

        let bytes = writer.into_bytes();
        let mut reader = ByteReader::new(&bytes);
        prop_assert_eq!(reader.u64().unwrap(), a);
        prop_assert_eq!(reader.i64().unwrap(), b);
        prop_assert_eq!(reader.f64().unwrap().to_bits(), c.to_bits());
        prop_assert_eq!(reader.str().unwrap(), s.as_str());
        prop_assert!(reader.at_end());
    }

    #[test]
    fn id_encoding_round_trip(ids in prop::collection::vec(prop::option::of(0u64..u64::MAX - 1), 0..32)) {
        let mut writer = ByteWriter::new();
        for id in &ids {
            writer.id(*id);
        }
        let bytes = writer.into_bytes();
        let mut reader = ByteReader::new(&bytes);
        for id in &ids {
            prop_assert_eq!(reader.id().unwrap(), *id);
        }
    }

    #[test]
    fn truncation_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let mut reader = ByteReader::new(&bytes);
        // Reading arbitrary garbage either yields values or errors; it
        // never panics or reads out of bounds.
        let _ = reader.u64();
        let _ = reader.bytes();
        let _ = reader.str();
    }
}

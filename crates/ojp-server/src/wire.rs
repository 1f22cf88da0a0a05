//! Wire codecs between [`DbValue`] and the protobuf value messages
//!
//! Decoding validates everything the client sends: timezone strings,
//! calendar/time ranges, UUID and URL syntax. An unset oneof is SQL NULL in
//! both directions, so absence round-trips as absence. Inside containers
//! every number is carried as a double (a documented precision loss for
//! very large integers), which keeps the container form decodable from any
//! client language.

use crate::error::ServerError;
use crate::value::{CalendarDate, DbValue, WallTime, ZonedTimestamp};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ojp_proto::wire_value::Kind;
use ojp_proto::{
    ListValue, MapEntry, MapValue, PropertiesValue, PropertyEntry, Row, TimestampWithZone,
    WireDate, WireRowId, WireTime, WireValue,
};

/// Decode one wire value into the host model.
pub fn decode_value(value: &WireValue) -> Result<DbValue, ServerError> {
    let Some(kind) = &value.kind else {
        return Ok(DbValue::Null);
    };
    match kind {
        Kind::BoolValue(b) => Ok(DbValue::Bool(*b)),
        Kind::Int32Value(i) => Ok(DbValue::Int32(*i)),
        Kind::Int64Value(i) => Ok(DbValue::Int64(*i)),
        Kind::DoubleValue(d) => Ok(DbValue::Double(*d)),
        Kind::StringValue(s) => Ok(DbValue::Text(s.clone())),
        Kind::BytesValue(b) => Ok(DbValue::Bytes(b.clone())),
        Kind::TimestampValue(ts) => Ok(DbValue::Timestamp(ZonedTimestamp::new(
            ts.epoch_seconds,
            ts.nanos,
            ts.timezone.clone(),
        )?)),
        Kind::DateValue(d) => Ok(DbValue::Date(CalendarDate::new(d.year, d.month, d.day)?)),
        Kind::TimeValue(t) => Ok(DbValue::Time(WallTime::new(
            t.hour, t.minute, t.second, t.nanos,
        )?)),
        Kind::UuidValue(s) => {
            if s.is_empty() {
                return Err(ServerError::InvalidArgument("empty UUID".to_string()));
            }
            let parsed = uuid::Uuid::parse_str(s)
                .map_err(|e| ServerError::InvalidArgument(format!("malformed UUID: {}", e)))?;
            Ok(DbValue::Uuid(parsed))
        }
        Kind::UrlValue(s) => {
            if s.is_empty() {
                return Err(ServerError::InvalidArgument("empty URL".to_string()));
            }
            let parsed = url::Url::parse(s)
                .map_err(|e| ServerError::InvalidArgument(format!("malformed URL: {}", e)))?;
            Ok(DbValue::Url(parsed))
        }
        Kind::RowidValue(rowid) => {
            let bytes = BASE64.decode(&rowid.base64).map_err(|e| {
                ServerError::InvalidArgument(format!("malformed row id encoding: {}", e))
            })?;
            Ok(DbValue::RowId(bytes))
        }
        Kind::MapValue(map) => {
            let mut entries = Vec::with_capacity(map.entries.len());
            for entry in &map.entries {
                let value = match &entry.value {
                    Some(v) => decode_value(v)?,
                    None => DbValue::Null,
                };
                entries.push((entry.key.clone(), value));
            }
            Ok(DbValue::Map(entries))
        }
        Kind::ListValue(list) => {
            let mut items = Vec::with_capacity(list.items.len());
            for item in &list.items {
                items.push(decode_value(item)?);
            }
            Ok(DbValue::List(items))
        }
        Kind::PropertiesValue(props) => Ok(DbValue::Properties(
            props
                .entries
                .iter()
                .map(|e| (e.key.clone(), e.value.clone()))
                .collect(),
        )),
    }
}

/// Encode one host value onto the wire.
pub fn encode_value(value: &DbValue) -> WireValue {
    let kind = match value {
        DbValue::Null => None,
        DbValue::Bool(b) => Some(Kind::BoolValue(*b)),
        DbValue::Int32(i) => Some(Kind::Int32Value(*i)),
        DbValue::Int64(i) => Some(Kind::Int64Value(*i)),
        DbValue::Double(d) => Some(Kind::DoubleValue(*d)),
        DbValue::Text(s) => Some(Kind::StringValue(s.clone())),
        DbValue::Bytes(b) => Some(Kind::BytesValue(b.clone())),
        DbValue::Timestamp(ts) => Some(Kind::TimestampValue(TimestampWithZone {
            epoch_seconds: ts.epoch_seconds,
            nanos: ts.nanos,
            timezone: ts.timezone.clone(),
        })),
        DbValue::Date(d) => Some(Kind::DateValue(WireDate {
            year: d.year,
            month: d.month,
            day: d.day,
        })),
        DbValue::Time(t) => Some(Kind::TimeValue(WireTime {
            hour: t.hour,
            minute: t.minute,
            second: t.second,
            nanos: t.nanos,
        })),
        DbValue::Uuid(u) => Some(Kind::UuidValue(u.to_string())),
        DbValue::Url(u) => Some(Kind::UrlValue(u.to_string())),
        DbValue::RowId(bytes) => Some(Kind::RowidValue(WireRowId {
            base64: BASE64.encode(bytes),
        })),
        DbValue::Map(entries) => Some(Kind::MapValue(MapValue {
            entries: entries
                .iter()
                .map(|(key, value)| MapEntry {
                    key: key.clone(),
                    value: Some(encode_container_value(value)),
                })
                .collect(),
        })),
        DbValue::List(items) => Some(Kind::ListValue(ListValue {
            items: items.iter().map(encode_container_value).collect(),
        })),
        DbValue::Properties(entries) => Some(Kind::PropertiesValue(PropertiesValue {
            entries: entries
                .iter()
                .map(|(key, value)| PropertyEntry {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        })),
    };
    WireValue { kind }
}

/// Container elements carry every number as a double.
fn encode_container_value(value: &DbValue) -> WireValue {
    match value {
        DbValue::Int32(i) => WireValue {
            kind: Some(Kind::DoubleValue(f64::from(*i))),
        },
        DbValue::Int64(i) => WireValue {
            kind: Some(Kind::DoubleValue(*i as f64)),
        },
        other => encode_value(other),
    }
}

/// Decode a parameter list.
pub fn decode_params(params: &[WireValue]) -> Result<Vec<DbValue>, ServerError> {
    params.iter().map(decode_value).collect()
}

/// Encode one result row.
pub fn encode_row(values: &[DbValue]) -> Row {
    Row {
        values: values.iter().map(encode_value).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: DbValue) -> DbValue {
        decode_value(&encode_value(&value)).unwrap()
    }

    #[test]
    fn test_null_roundtrip() {
        assert_eq!(roundtrip(DbValue::Null), DbValue::Null);
        // Absent input decodes to absent output.
        assert_eq!(decode_value(&WireValue { kind: None }).unwrap(), DbValue::Null);
    }

    #[test]
    fn test_scalar_roundtrips() {
        for value in [
            DbValue::Bool(true),
            DbValue::Int32(-5),
            DbValue::Int64(i64::MAX),
            DbValue::Double(2.5),
            DbValue::Text("héllo".to_string()),
            DbValue::Bytes(vec![0, 1, 255]),
        ] {
            assert_eq!(roundtrip(value.clone()), value);
        }
    }

    #[test]
    fn test_timestamp_roundtrip_preserves_nanos_and_zone() {
        let ts = ZonedTimestamp::new(1_730_554_245, 123_456_789, "Europe/Rome").unwrap();
        let out = roundtrip(DbValue::Timestamp(ts.clone()));
        let DbValue::Timestamp(decoded) = out else {
            panic!("wrong kind");
        };
        assert_eq!(decoded.epoch_seconds, ts.epoch_seconds);
        assert_eq!(decoded.nanos, 123_456_789);
        assert_eq!(decoded.timezone, "Europe/Rome");
    }

    #[test]
    fn test_timestamp_offset_zone_roundtrip() {
        let ts = ZonedTimestamp::new(0, 1, "+05:30").unwrap();
        assert_eq!(roundtrip(DbValue::Timestamp(ts.clone())), DbValue::Timestamp(ts));
    }

    #[test]
    fn test_timestamp_bad_zone_rejected() {
        for zone in ["", "Nowhere/AtAll"] {
            let wire = WireValue {
                kind: Some(Kind::TimestampValue(TimestampWithZone {
                    epoch_seconds: 0,
                    nanos: 0,
                    timezone: zone.to_string(),
                })),
            };
            assert!(matches!(
                decode_value(&wire),
                Err(ServerError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_date_and_time_roundtrip() {
        let date = DbValue::Date(CalendarDate::new(2024, 11, 2).unwrap());
        assert_eq!(roundtrip(date.clone()), date);

        let time = DbValue::Time(WallTime::new(14, 30, 45, 123_456_789).unwrap());
        assert_eq!(roundtrip(time.clone()), time);
    }

    #[test]
    fn test_date_out_of_range_rejected() {
        let wire = WireValue {
            kind: Some(Kind::DateValue(WireDate {
                year: 2024,
                month: 13,
                day: 1,
            })),
        };
        assert!(matches!(
            decode_value(&wire),
            Err(ServerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_uuid_roundtrip_and_validation() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(roundtrip(DbValue::Uuid(id)), DbValue::Uuid(id));

        for bad in ["", "not-a-uuid"] {
            let wire = WireValue {
                kind: Some(Kind::UuidValue(bad.to_string())),
            };
            assert!(matches!(
                decode_value(&wire),
                Err(ServerError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_url_roundtrip_and_validation() {
        let parsed = url::Url::parse("https://example.com/db?a=1").unwrap();
        assert_eq!(roundtrip(DbValue::Url(parsed.clone())), DbValue::Url(parsed));

        for bad in ["", "::not a url::"] {
            let wire = WireValue {
                kind: Some(Kind::UrlValue(bad.to_string())),
            };
            assert!(matches!(
                decode_value(&wire),
                Err(ServerError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_rowid_empty_is_distinct_from_null() {
        let empty = roundtrip(DbValue::RowId(vec![]));
        assert_eq!(empty, DbValue::RowId(vec![]));
        assert!(!empty.is_null());

        let bytes = roundtrip(DbValue::RowId(vec![1, 2, 3]));
        assert_eq!(bytes, DbValue::RowId(vec![1, 2, 3]));
    }

    #[test]
    fn test_empty_containers_are_present() {
        let encoded = encode_value(&DbValue::Map(vec![]));
        assert!(encoded.kind.is_some());
        assert_eq!(roundtrip(DbValue::Map(vec![])), DbValue::Map(vec![]));
        assert_eq!(roundtrip(DbValue::List(vec![])), DbValue::List(vec![]));
        assert_eq!(
            roundtrip(DbValue::Properties(vec![])),
            DbValue::Properties(vec![])
        );
    }

    #[test]
    fn test_container_numbers_carried_as_doubles() {
        let list = DbValue::List(vec![DbValue::Int32(3), DbValue::Int64(7)]);
        let decoded = roundtrip(list);
        assert_eq!(
            decoded,
            DbValue::List(vec![DbValue::Double(3.0), DbValue::Double(7.0)])
        );
    }

    #[test]
    fn test_nested_containers() {
        let nested = DbValue::Map(vec![(
            "outer".to_string(),
            DbValue::List(vec![
                DbValue::Text("x".to_string()),
                DbValue::Map(vec![("inner".to_string(), DbValue::Bool(true))]),
            ]),
        )]);
        assert_eq!(roundtrip(nested.clone()), nested);
    }

    #[test]
    fn test_properties_roundtrip() {
        let props = DbValue::Properties(vec![
            ("user".to_string(), "app".to_string()),
            ("cache".to_string(), "on".to_string()),
        ]);
        assert_eq!(roundtrip(props.clone()), props);
    }
}

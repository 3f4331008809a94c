// Copyright 2025-2026 CEMAXECUTER LLC

//! Device argument marshalling: the `"key=value, key=value"` markup used
//! by the factory and the CLI, and typed setting conversions.

use std::collections::BTreeMap;

use crate::Error;

/// Key/value device arguments. A sorted map keeps the serialized markup
/// deterministic, which the factory relies on for its lookup keys.
pub type Kwargs = BTreeMap<String, String>;

/// Serialize a kwargs map to `"k0=v0, k1=v1"` markup.
pub fn serialize_kwargs(args: &Kwargs) -> String {
    let mut out = String::new();
    for (key, value) in args {
        if !out.is_empty() {
            out.push_str(", ");
        }
        out.push_str(key);
        out.push('=');
        out.push_str(value);
    }
    out
}

/// Parse `"k=v, k=v"` markup into a kwargs map.
///
/// Commas terminate a pair and equal signs separate key from value;
/// whitespace around either is trimmed and pairs with empty keys are
/// discarded.
pub fn parse_kwargs(markup: &str) -> Kwargs {
    enum State {
        InKey,
        InValue,
    }

    let mut args = Kwargs::new();
    let mut state = State::InKey;
    let mut key = String::new();
    let mut value = String::new();

    for ch in markup.chars() {
        match state {
            State::InKey => match ch {
                '=' => state = State::InValue,
                ',' => key.clear(),
                _ => key.push(ch),
            },
            State::InValue => match ch {
                ',' => {
                    store_pair(&mut args, &key, &value);
                    key.clear();
                    value.clear();
                    state = State::InKey;
                }
                _ => value.push(ch),
            },
        }
    }
    if let State::InValue = state {
        store_pair(&mut args, &key, &value);
    }
    args
}

fn store_pair(args: &mut Kwargs, key: &str, value: &str) {
    let key = key.trim();
    if key.is_empty() {
        return;
    }
    args.insert(key.to_string(), value.trim().to_string());
}

/// Parse a boolean setting value. Accepts the forms drivers see in
/// practice: `true`/`false`, `1`/`0`, `yes`/`no`, case-insensitive.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Typed setting read: fetch `key` from `args` and convert through the
/// string form.
pub fn typed_arg<T: std::str::FromStr>(args: &Kwargs, key: &str) -> Result<Option<T>, Error> {
    match args.get(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| Error::InvalidSetting {
            key: key.to_string(),
            value: raw.clone(),
        }),
    }
}

/// Typed setting read with a fallback when the key is absent.
pub fn typed_arg_or<T: std::str::FromStr>(args: &Kwargs, key: &str, default: T) -> Result<T, Error> {
    Ok(typed_arg(args, key)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kw(pairs: &[(&str, &str)]) -> Kwargs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_serialize_basic() {
        let args = kw(&[("driver", "hackrf"), ("serial", "0123")]);
        assert_eq!(serialize_kwargs(&args), "driver=hackrf, serial=0123");
    }

    #[test]
    fn test_serialize_empty() {
        assert_eq!(serialize_kwargs(&Kwargs::new()), "");
    }

    #[test]
    fn test_parse_basic() {
        let args = parse_kwargs("driver=rtlsdr, serial=00000001");
        assert_eq!(args, kw(&[("driver", "rtlsdr"), ("serial", "00000001")]));
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let args = parse_kwargs("  driver =  null ,label= Null Device ");
        assert_eq!(args.get("driver").map(String::as_str), Some("null"));
        assert_eq!(args.get("label").map(String::as_str), Some("Null Device"));
    }

    #[test]
    fn test_parse_discards_empty_keys() {
        let args = parse_kwargs(", =value, driver=null,");
        assert_eq!(args.len(), 1);
        assert_eq!(args.get("driver").map(String::as_str), Some("null"));
    }

    #[test]
    fn test_parse_value_may_be_empty() {
        let args = parse_kwargs("serial=");
        assert_eq!(args.get("serial").map(String::as_str), Some(""));
    }

    #[test]
    fn test_markup_roundtrip() {
        // Holds for any map whose keys and values avoid ',' and '='.
        let cases = [
            kw(&[]),
            kw(&[("driver", "airspy")]),
            kw(&[("a", "1"), ("b", "two"), ("c", "3.5"), ("bias_tx", "true")]),
        ];
        for args in cases {
            assert_eq!(parse_kwargs(&serialize_kwargs(&args)), args);
        }
    }

    #[test]
    fn test_parse_bool_forms() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("false"), Some(false));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool(""), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_typed_arg_conversions() {
        let args = kw(&[("buffers", "15"), ("rate", "2.4e6"), ("agc", "false")]);
        assert_eq!(typed_arg::<u32>(&args, "buffers").unwrap(), Some(15));
        assert_eq!(typed_arg::<f64>(&args, "rate").unwrap(), Some(2.4e6));
        assert_eq!(typed_arg::<bool>(&args, "agc").unwrap(), Some(false));
        assert_eq!(typed_arg::<u32>(&args, "missing").unwrap(), None);
        assert_eq!(typed_arg_or::<u32>(&args, "missing", 7).unwrap(), 7);
        assert!(typed_arg::<u32>(&args, "rate").is_err());
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Carriers for cross-process propagation headers.
//!
//! A carrier is whatever the instrumentation shim hands us: HTTP headers
//! collected into a map, or message metadata as a JSON object. Header names
//! are case-insensitive. Injected names are written lowercased; extraction
//! matches a name in any case, since inbound maps keep whatever case the
//! wire used.

use std::collections::HashMap;
use std::hash::BuildHasher;

use serde_json::Value;

/// Writes propagation headers into a carrier.
pub trait Injector {
    fn set(&mut self, key: &str, value: String);
}

/// Reads propagation headers from a carrier.
pub trait Extractor {
    /// Value of the header `key`, compared without regard to ASCII case.
    fn get(&self, key: &str) -> Option<&str>;
}

impl<S: BuildHasher> Injector for HashMap<String, String, S> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_ascii_lowercase(), value);
    }
}

impl<S: BuildHasher> Extractor for HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<&str> {
        HashMap::get(self, &key.to_ascii_lowercase())
            .or_else(|| {
                self.iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(key))
                    .map(|(_, value)| value)
            })
            .map(String::as_str)
    }
}

/// Only `Value::Object` carries headers; any other variant ignores writes.
impl Injector for Value {
    fn set(&mut self, key: &str, value: String) {
        if let Value::Object(map) = self {
            map.insert(key.to_ascii_lowercase(), Value::String(value));
        }
    }
}

/// Non-string values read as absent.
impl Extractor for Value {
    fn get(&self, key: &str) -> Option<&str> {
        let Value::Object(map) = self else {
            return None;
        };
        map.get(&key.to_ascii_lowercase())
            .or_else(|| {
                map.iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(key))
                    .map(|(_, value)| value)
            })
            .and_then(Value::as_str)
    }
}

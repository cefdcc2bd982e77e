//! `#[serde(with = "crate::buffers")]` codec for binary message buffers.
//!
//! Buffers travel as a JSON array of base64 strings. A missing or `null`
//! field decodes to no buffers.

use base64::prelude::*;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S>(buffers: &[Bytes], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_seq(buffers.iter().map(|b| BASE64_STANDARD.encode(b)))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Bytes>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(encoded) = Option::<Vec<String>>::deserialize(deserializer)? else {
        return Ok(Vec::new());
    };

    encoded
        .into_iter()
        .map(|s| {
            BASE64_STANDARD
                .decode(s.as_bytes())
                .map(Bytes::from)
                .map_err(serde::de::Error::custom)
        })
        .collect()
}

//! Wire codecs for values held in the store.
//!
//! Each logical store picks exactly one codec through a type alias
//! (e.g. [`crate::broker::EnvelopeCodec`]), so encoding is never decided
//! per call site.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Encodes and decodes one item type to the store's string representation.
pub trait Codec {
    type Item;

    fn encode(item: &Self::Item) -> Result<String>;
    fn decode(raw: &str) -> Result<Self::Item>;
}

/// JSON codec for any serde type.
pub struct Json<T>(PhantomData<T>);

impl<T> Codec for Json<T>
where
    T: Serialize + DeserializeOwned,
{
    type Item = T;

    fn encode(item: &T) -> Result<String> {
        Ok(serde_json::to_string(item)?)
    }

    fn decode(raw: &str) -> Result<T> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        n: u32,
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Json::<Probe>::decode("not json").is_err());
        assert_eq!(Json::<Probe>::decode(r#"{"n":4}"#).unwrap(), Probe { n: 4 });
    }
}

//! Stub blob parsing.
//!
//! The binary stub images themselves are opaque, caller-supplied data:
//! sourcing the JSON document (reading it from a file, fetching it as a
//! build resource) is out of scope here. This module only turns the text
//! the caller hands it into a [`StubBlob`] ready for
//! [`crate::engine::ProtocolEngine::load_stub`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;

use crate::error::Error;

#[derive(Deserialize)]
struct StubDocument {
    entry: u32,
    text_start: u32,
    data_start: u32,
    text: String,
    data: String,
}

/// A stub loader image ready to be uploaded into a chip's RAM.
#[derive(Debug, Clone)]
pub struct StubBlob {
    pub entry: u32,
    pub text_addr: u32,
    pub data_addr: u32,
    pub text: Vec<u8>,
    pub data: Vec<u8>,
}

impl StubBlob {
    /// Parse a stub blob from its JSON document: `entry`, `text_start`,
    /// `data_start` as integers, `text`/`data` as base64 strings.
    pub fn parse(json: &str) -> Result<Self, Error> {
        let doc: StubDocument = serde_json::from_str(json)
            .map_err(|e| Error::InvalidStubBlob(e.to_string()))?;
        let text = STANDARD
            .decode(&doc.text)
            .map_err(|e| Error::InvalidStubBlob(format!("text: {e}")))?;
        let data = STANDARD
            .decode(&doc.data)
            .map_err(|e| Error::InvalidStubBlob(format!("data: {e}")))?;
        Ok(StubBlob {
            entry: doc.entry,
            text_addr: doc.text_start,
            data_addr: doc.data_start,
            text,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let json = r#"{
            "entry": 1024,
            "text_start": 2048,
            "data_start": 4096,
            "text": "AQID",
            "data": "BAUG"
        }"#;
        let stub = StubBlob::parse(json).unwrap();
        assert_eq!(stub.entry, 1024);
        assert_eq!(stub.text_addr, 2048);
        assert_eq!(stub.data_addr, 4096);
        assert_eq!(stub.text, vec![1, 2, 3]);
        assert_eq!(stub.data, vec![4, 5, 6]);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(StubBlob::parse("not json").is_err());
    }

    #[test]
    fn rejects_bad_base64() {
        let json = r#"{
            "entry": 0,
            "text_start": 0,
            "data_start": 0,
            "text": "not-valid-base64!!",
            "data": ""
        }"#;
        assert!(StubBlob::parse(json).is_err());
    }
}

//! Tiny helper for loading a JSON document from a path into a typed value.

use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::BufReader;

pub fn load<T: DeserializeOwned>(path: &str) -> std::io::Result<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

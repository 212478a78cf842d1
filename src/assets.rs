//! Side-channel artifacts emitted while rendering and their merge registry.
//!
//! Workers never mutate the registry directly; they return assets as part of
//! the render response and the coordinator folds them in as responses
//! arrive on its own execution context.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Merge semantics for an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetKind {
    /// A generated file payload (e.g. an on-demand image variant);
    /// last writer wins per key
    Image,
    /// A reference emitted for a page (e.g. a preload hint); accumulated as
    /// an additive set per key
    Link,
}

/// An artifact produced opportunistically during a single render call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedAsset {
    pub key: String,
    pub kind: AssetKind,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

impl SerializedAsset {
    pub fn image(key: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            kind: AssetKind::Image,
            bytes,
        }
    }

    pub fn link(key: impl Into<String>, href: &str) -> Self {
        Self {
            key: key.into(),
            kind: AssetKind::Link,
            bytes: href.as_bytes().to_vec(),
        }
    }
}

// Asset payloads are binary but the serialized cache and messages must stay
// JSON-representable, so bytes travel base64-encoded.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Coordinator-owned registry of all assets produced across the build
#[derive(Debug, Default)]
pub struct AssetRegistry {
    files: BTreeMap<String, Vec<u8>>,
    references: BTreeMap<String, BTreeSet<String>>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a render call's assets into the registry.
    pub fn merge(&mut self, assets: Vec<SerializedAsset>) {
        for asset in assets {
            match asset.kind {
                AssetKind::Image => {
                    self.files.insert(asset.key, asset.bytes);
                }
                AssetKind::Link => {
                    let href = String::from_utf8_lossy(&asset.bytes).into_owned();
                    self.references.entry(asset.key).or_default().insert(href);
                }
            }
        }
    }

    pub fn file(&self, key: &str) -> Option<&[u8]> {
        self.files.get(key).map(Vec::as_slice)
    }

    pub fn references(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.references.get(key)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.references.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_assets_are_last_writer_wins() {
        let mut registry = AssetRegistry::new();
        registry.merge(vec![SerializedAsset::image("img/a.png", vec![1, 2])]);
        registry.merge(vec![SerializedAsset::image("img/a.png", vec![3, 4])]);
        assert_eq!(registry.file("img/a.png"), Some(&[3u8, 4][..]));
        assert_eq!(registry.file_count(), 1);
    }

    #[test]
    fn link_assets_accumulate_as_a_set() {
        let mut registry = AssetRegistry::new();
        registry.merge(vec![
            SerializedAsset::link("/blog/1", "/assets/app.css"),
            SerializedAsset::link("/blog/1", "/assets/app.js"),
        ]);
        registry.merge(vec![SerializedAsset::link("/blog/1", "/assets/app.css")]);
        let refs = registry.references("/blog/1").unwrap();
        assert_eq!(refs.len(), 2);
        assert!(refs.contains("/assets/app.js"));
    }

    #[test]
    fn bytes_travel_base64_encoded() {
        let asset = SerializedAsset::image("img/a.png", vec![0, 159, 146, 150]);
        let json = serde_json::to_value(&asset).unwrap();
        assert!(json["bytes"].is_string());
        let back: SerializedAsset = serde_json::from_value(json).unwrap();
        assert_eq!(back, asset);
    }
}

use bytes::Bytes;
use std::fmt::{Display, Formatter};

/// Metadata value: either printable text or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Bytes),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(value) => Some(value),
            MetadataValue::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MetadataValue::Ascii(value) => value.as_bytes(),
            MetadataValue::Binary(value) => value.as_ref(),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Ascii(value.to_owned())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Ascii(value)
    }
}

impl From<Bytes> for MetadataValue {
    fn from(value: Bytes) -> Self {
        MetadataValue::Binary(value)
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(value: Vec<u8>) -> Self {
        MetadataValue::Binary(Bytes::from(value))
    }
}

/// Ordered multimap used for request headers, response headers and trailers.
///
/// Keys are case-insensitive and kept lowercase. Insertion order is preserved,
/// including the relative order of repeated keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
    pub fn new() -> Metadata {
        Metadata::default()
    }

    /// Appends `value` under `key`, keeping any values already stored for it.
    pub fn append<KEY: AsRef<str>, VALUE: Into<MetadataValue>>(&mut self, key: KEY, value: VALUE) {
        self.entries
            .push((key.as_ref().to_ascii_lowercase(), value.into()));
    }

    /// Replaces all values stored under `key` with `value`.
    pub fn insert<KEY: AsRef<str>, VALUE: Into<MetadataValue>>(&mut self, key: KEY, value: VALUE) {
        self.remove(key.as_ref());
        self.append(key, value);
    }

    pub fn remove(&mut self, key: &str) -> usize {
        let key = key.to_ascii_lowercase();
        let before = self.entries.len();
        self.entries.retain(|(entry_key, _)| *entry_key != key);
        before - self.entries.len()
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(entry_key, _)| *entry_key == key)
            .map(|(_, value)| value)
    }

    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a MetadataValue> + 'a {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(entry_key, _)| *entry_key == key)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn extend(&mut self, other: Metadata) {
        self.entries.extend(other.entries)
    }
}

impl<KEY: AsRef<str>, VALUE: Into<MetadataValue>> FromIterator<(KEY, VALUE)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (KEY, VALUE)>>(iter: T) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.append(key, value);
        }
        metadata
    }
}

impl Display for Metadata {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_list();
        for (key, value) in self.iter() {
            match value {
                MetadataValue::Ascii(text) => list.entry(&format_args!("{}: {}", key, text)),
                MetadataValue::Binary(bytes) => {
                    list.entry(&format_args!("{}: <{} bytes>", key, bytes.len()))
                }
            };
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_insertion_order_of_repeated_keys() {
        let mut metadata = Metadata::new();
        metadata.append("Accept", "a");
        metadata.append("user", "u");
        metadata.append("accept", "b");

        let accepts: Vec<_> = metadata
            .get_all("ACCEPT")
            .filter_map(MetadataValue::as_str)
            .collect();
        assert_eq!(vec!["a", "b"], accepts);
        assert_eq!(Some(&MetadataValue::from("a")), metadata.get("accept"));
        let keys: Vec<_> = metadata.iter().map(|(key, _)| key).collect();
        assert_eq!(vec!["accept", "user", "accept"], keys);
    }

    #[test]
    fn insert_replaces_all_values() {
        let mut metadata: Metadata = [("k", "1"), ("k", "2"), ("other", "x")].into_iter().collect();
        metadata.insert("K", Bytes::from_static(b"\x00\x01"));
        assert_eq!(2, metadata.len());
        assert_eq!(
            Some(&MetadataValue::Binary(Bytes::from_static(b"\x00\x01"))),
            metadata.get("k")
        );
    }

    #[test]
    fn binary_values_are_not_text() {
        let value = MetadataValue::from(vec![0xff, 0x00]);
        assert_eq!(None, value.as_str());
        assert_eq!(&[0xff, 0x00], value.as_bytes());
    }
}

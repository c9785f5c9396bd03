//! Structured request building and typed field access for plist messages.

use plist::{Dictionary, Value};

/// Builder for an outgoing request dictionary.
///
/// ```
/// use mobdev_proto::Request;
///
/// let req = Request::new()
///     .with("Request", "GetValue")
///     .with_opt("Domain", None::<&str>)
///     .with("Key", "DeviceName");
/// assert_eq!(req.as_dict().len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[must_use]
pub struct Request(Dictionary);

impl Request {
    /// Creates an empty request.
    pub fn new() -> Self {
        Self(Dictionary::new())
    }

    /// Sets `key` to `value`.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_owned(), value.into());
        self
    }

    /// Sets `key` only when `value` is present.
    pub fn with_opt(self, key: &str, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }

    /// Sets `key` to a binary data blob.
    pub fn with_data(mut self, key: &str, data: impl Into<Vec<u8>>) -> Self {
        self.0.insert(key.to_owned(), Value::Data(data.into()));
        self
    }

    /// Borrows the underlying dictionary.
    pub const fn as_dict(&self) -> &Dictionary {
        &self.0
    }

    /// Returns the underlying dictionary.
    pub fn into_dict(self) -> Dictionary {
        self.0
    }

    /// Returns the request as a plist value ready for framing.
    pub fn into_value(self) -> Value {
        Value::Dictionary(self.0)
    }
}

impl From<Dictionary> for Request {
    fn from(dict: Dictionary) -> Self {
        Self(dict)
    }
}

/// Typed accessors over a received dictionary.
///
/// Every accessor returns `None` when the key is absent or holds a value
/// of another type.
pub trait DictExt {
    /// String value of `key`.
    fn string(&self, key: &str) -> Option<&str>;
    /// Non-negative integer value of `key`.
    fn uint(&self, key: &str) -> Option<u64>;
    /// Signed integer value of `key`.
    fn int(&self, key: &str) -> Option<i64>;
    /// Boolean value of `key`.
    fn boolean(&self, key: &str) -> Option<bool>;
    /// Data blob of `key`.
    fn data(&self, key: &str) -> Option<&[u8]>;
    /// Nested dictionary at `key`.
    fn dict(&self, key: &str) -> Option<&Dictionary>;
    /// Array at `key`.
    fn array(&self, key: &str) -> Option<&[Value]>;
}

impl DictExt for Dictionary {
    fn string(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_string)
    }

    fn uint(&self, key: &str) -> Option<u64> {
        let value = self.get(key)?;
        value
            .as_unsigned_integer()
            .or_else(|| value.as_signed_integer().and_then(|v| u64::try_from(v).ok()))
    }

    fn int(&self, key: &str) -> Option<i64> {
        let value = self.get(key)?;
        value
            .as_signed_integer()
            .or_else(|| value.as_unsigned_integer().and_then(|v| i64::try_from(v).ok()))
    }

    fn boolean(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_boolean)
    }

    fn data(&self, key: &str) -> Option<&[u8]> {
        self.get(key).and_then(Value::as_data)
    }

    fn dict(&self, key: &str) -> Option<&Dictionary> {
        self.get(key).and_then(Value::as_dictionary)
    }

    fn array(&self, key: &str) -> Option<&[Value]> {
        self.get(key).and_then(Value::as_array).map(Vec::as_slice)
    }
}

/// Encodes a list of strings as a plist array.
pub fn string_array<I, S>(items: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Value::Array(items.into_iter().map(|s| Value::String(s.into())).collect())
}

/// Decodes a plist array whose elements are all strings.
///
/// Returns `None` if `value` is not an array or any element is not a string.
pub fn strings_from(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_string().map(str::to_owned))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_opt_skips_absent_values() {
        let req = Request::new()
            .with("Request", "StartService")
            .with_opt("EscrowBag", None::<Vec<Value>>)
            .with_opt("Service", Some("com.apple.afc"));
        let dict = req.into_dict();
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.string("Service"), Some("com.apple.afc"));
        assert!(!dict.contains_key("EscrowBag"));
    }

    #[test]
    fn accessors_reject_mismatched_types() {
        let dict = Request::new()
            .with("Port", 49152u64)
            .with("EnableServiceSSL", true)
            .with("Name", "iPhone")
            .into_dict();
        assert_eq!(dict.uint("Port"), Some(49152));
        assert_eq!(dict.int("Port"), Some(49152));
        assert_eq!(dict.boolean("EnableServiceSSL"), Some(true));
        assert_eq!(dict.string("Port"), None);
        assert_eq!(dict.uint("Name"), None);
        assert_eq!(dict.data("Missing"), None);
    }

    #[test]
    fn negative_integers_are_not_unsigned() {
        let dict = Request::new().with("Offset", -3i64).into_dict();
        assert_eq!(dict.uint("Offset"), None);
        assert_eq!(dict.int("Offset"), Some(-3));
    }

    #[test]
    fn string_arrays() {
        let value = string_array(["CFBundleIdentifier", "Path"]);
        assert_eq!(
            strings_from(&value),
            Some(vec!["CFBundleIdentifier".to_owned(), "Path".to_owned()])
        );
        let mixed = Value::Array(vec!["a".into(), Value::Boolean(false)]);
        assert_eq!(strings_from(&mixed), None);
    }
}

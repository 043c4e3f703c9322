//! Query-string and path parameters of a request.

use crate::protocol::ParseError;
use std::collections::HashMap;

/// Multi-valued query parameters; values keep the order they appeared in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    params: HashMap<String, Vec<String>>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes an `application/x-www-form-urlencoded` query string.
    pub fn parse(query: &str) -> Result<Self, ParseError> {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).map_err(ParseError::invalid_uri)?;

        let mut params = Self::new();
        for (name, value) in pairs {
            params.append(name, value);
        }
        Ok(params)
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.entry(name.into()).or_default().push(value.into());
    }

    /// The first value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(|values| values.first()).map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.params.get(name).map_or(&[], Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.params.iter().map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn clear(&mut self) {
        self.params.clear();
    }
}

/// Parameters recovered from the matched route template.
///
/// Named segments (`/user/:id`) land in the name→value map, wildcard captures (`/static/*`)
/// in `splat`, in the order they appear in the template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams {
    params: HashMap<String, String>,
    splat: Vec<String>,
}

impl PathParams {
    pub fn new(params: HashMap<String, String>, splat: Vec<String>) -> Self {
        Self { params, splat }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn splat(&self) -> &[String] {
        &self.splat
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.splat.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_multi_valued_query() {
        let params = QueryParams::parse("a=1&b=two&a=3&c=hello%20world").unwrap();

        assert_eq!(params.len(), 3);
        assert_eq!(params.get("a"), Some("1"));
        assert_eq!(params.get_all("a"), &["1".to_string(), "3".to_string()]);
        assert_eq!(params.get("c"), Some("hello world"));
        assert_eq!(params.get("missing"), None);
        assert!(params.get_all("missing").is_empty());
    }

    #[test]
    fn parse_empty_query() {
        assert!(QueryParams::parse("").unwrap().is_empty());
    }
}

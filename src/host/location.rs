// src/host/location.rs
// Current page URL with replace-state query updates

use parking_lot::RwLock;
use url::Url;

/// The page location.
///
/// Query updates behave like `history.replaceState`: the URL changes, no
/// navigation happens.
pub struct Location {
    url: RwLock<Url>,
}

impl Location {
    pub fn new(url: Url) -> Self {
        Self {
            url: RwLock::new(url),
        }
    }

    pub fn parse(url: &str) -> crate::Result<Self> {
        Ok(Self::new(Url::parse(url)?))
    }

    pub fn href(&self) -> String {
        self.url.read().to_string()
    }

    pub fn path(&self) -> String {
        self.url.read().path().to_string()
    }

    pub fn query_param(&self, key: &str) -> Option<String> {
        self.url
            .read()
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// Set or (with `None`) remove a query parameter, keeping the others in order
    pub fn replace_query_param(&self, key: &str, value: Option<&str>) {
        let mut url = self.url.write();
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != key)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if let Some(value) = value {
            pairs.push((key.to_string(), value.to_string()));
        }

        if pairs.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }
    }
}

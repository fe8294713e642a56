use chrono::Utc;
use getset::Getters;
use multimap::MultiMap;
use url::Url;

/// Ordered collection of query parameters for building request URLs.
#[derive(Debug, Default, Clone, Getters)]
#[get = "pub"]
pub struct QueryParameters {
    params: MultiMap<String, String>,
}

impl QueryParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.params.insert(key.into(), value.into());
    }

    /// Append all parameters to the query string of `url`.
    pub fn apply(&self, url: &mut Url) {
        let mut pairs = url.query_pairs_mut();
        for (key, values) in self.params.iter_all() {
            for value in values {
                pairs.append_pair(key, value);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Name of the cache-busting query parameter.
pub const CACHE_BUSTER_PARAM: &str = "_";

/// A fresh cache-buster value (current time in milliseconds).
pub fn cache_buster() -> String {
    Utc::now().timestamp_millis().to_string()
}

/// Append a cache-busting `_=<millis>` parameter, preserving any existing
/// query string.
pub fn with_cache_buster(url: &str) -> String {
    let mut params = QueryParameters::new();
    params.append(CACHE_BUSTER_PARAM, cache_buster());
    match Url::parse(url) {
        Ok(mut parsed) => {
            params.apply(&mut parsed);
            parsed.to_string()
        }
        Err(err) => {
            log::warn!("Cannot parse URL for cache buster {}: {}", url, err);
            url.to_string()
        }
    }
}

/// Strip the query string from a URL, leaving the base resource address.
pub fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

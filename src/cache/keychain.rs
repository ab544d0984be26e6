use serde::{Deserialize, Serialize};

use super::key::CacheKey;

/// Backing-store keys derived from one [`CacheKey`].
///
/// `root` and `fetching_lock` are never stored directly by the cache, so [`KeyChain::iter`]
/// leaves them out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChain {
    root: String,
    main: String,
    entities: String,
    headers: String,
    reval_params: String,
    reval_req_headers: String,
    fetching_lock: String,
}

impl KeyChain {
    pub fn new(key: &CacheKey) -> Self {
        let root = key.as_str();
        Self {
            root: root.to_string(),
            main: format!("{root}::main"),
            entities: format!("{root}::entities"),
            headers: format!("{root}::headers"),
            reval_params: format!("{root}::reval_params"),
            reval_req_headers: format!("{root}::reval_req_headers"),
            fetching_lock: format!("{root}::fetching"),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Hash of response metadata.
    pub fn main(&self) -> &str {
        &self.main
    }

    /// Set of live entity ids.
    pub fn entities(&self) -> &str {
        &self.entities
    }

    pub fn headers(&self) -> &str {
        &self.headers
    }

    pub fn reval_params(&self) -> &str {
        &self.reval_params
    }

    pub fn reval_req_headers(&self) -> &str {
        &self.reval_req_headers
    }

    pub fn fetching_lock(&self) -> &str {
        &self.fetching_lock
    }

    /// Named keys that hold data, excluding `root` and `fetching_lock`.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("main", self.main.as_str()),
            ("entities", self.entities.as_str()),
            ("headers", self.headers.as_str()),
            ("reval_params", self.reval_params.as_str()),
            ("reval_req_headers", self.reval_req_headers.as_str()),
        ]
        .into_iter()
    }

    pub fn keys(&self) -> Vec<String> {
        self.iter().map(|(_, key)| key.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> KeyChain {
        KeyChain::new(&CacheKey::from("hoard:cache:http:h:/p:".to_string()))
    }

    #[test]
    fn building_twice_is_identical() {
        assert_eq!(chain(), chain());
    }

    #[test]
    fn iteration_skips_root_and_fetching_lock() {
        let chain = chain();
        let names: Vec<&str> = chain.iter().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            ["main", "entities", "headers", "reval_params", "reval_req_headers"]
        );
        assert!(!chain.keys().iter().any(|key| key == chain.root()));
        assert!(!chain.keys().iter().any(|key| key == chain.fetching_lock()));
    }

    #[test]
    fn suffixes_follow_the_root() {
        let chain = chain();
        assert_eq!(chain.main(), "hoard:cache:http:h:/p:::main");
        assert_eq!(chain.fetching_lock(), "hoard:cache:http:h:/p:::fetching");
    }
}

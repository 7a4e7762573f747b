//! Cache policy threaded explicitly through every `UpstreamClient` and
//! `StreamEngine` call as a plain enum parameter, the way
//! `rattler_repodata_gateway::fetch::CacheAction` does.

/// Defines how a request is allowed to use the in-memory HTTP response
/// cache and, by extension, the network.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheAction {
    /// Use a fresh cache entry if one exists, otherwise fetch from the
    /// network. The default mode for ordinary requests.
    #[default]
    CacheOrFetch,

    /// Only use the cache, but error out if the cached entry is not fresh.
    UseCacheOnly,

    /// Only use the cache, ignore freshness entirely.
    ForceCacheOnly,

    /// Bypass the in-memory HTTP response cache even if a fresh entry
    /// exists.
    NoCache,
}

impl CacheAction {
    /// Whether this action permits a network round-trip at all.
    pub fn allows_network(self) -> bool {
        !matches!(self, CacheAction::ForceCacheOnly | CacheAction::UseCacheOnly)
    }

    /// Whether this action permits reading the in-memory cache.
    pub fn allows_cache_read(self) -> bool {
        !matches!(self, CacheAction::NoCache)
    }

    /// Whether a cache miss under this action should fail instead of
    /// falling through to the network.
    pub fn cache_miss_is_fatal(self) -> bool {
        matches!(self, CacheAction::ForceCacheOnly | CacheAction::UseCacheOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::CacheAction;

    #[test]
    fn default_is_cache_or_fetch() {
        assert_eq!(CacheAction::default(), CacheAction::CacheOrFetch);
    }

    #[test]
    fn only_cache_only_modes_are_network_free() {
        assert!(!CacheAction::ForceCacheOnly.allows_network());
        assert!(!CacheAction::UseCacheOnly.allows_network());
        assert!(CacheAction::CacheOrFetch.allows_network());
        assert!(CacheAction::NoCache.allows_network());
    }

    #[test]
    fn no_cache_still_allows_network_but_not_cache_read() {
        assert!(!CacheAction::NoCache.allows_cache_read());
        assert!(CacheAction::CacheOrFetch.allows_cache_read());
    }
}

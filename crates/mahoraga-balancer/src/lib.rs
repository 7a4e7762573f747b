//! Produces a load-balanced, failure-restartable ordering over a request's
//! candidate mirror URLs.
//!
//! The ranking itself lives in [`mahoraga_ledger::StatisticsLedger::key`];
//! this crate only does the pull-based selection: the next URL is chosen
//! only when asked for, so a mirror that goes from idle to overloaded mid
//! request changes the order of URLs not yet tried. `Iterator::next` can't
//! be `async`, and reading the ledger is synchronous anyway (an in-memory
//! `DashMap` lookup), so this is expressed as a plain synchronous cursor
//! rather than a `futures::Stream` — matching the re-architecture note in
//! spec.md §9 ("a pull-based iterator... not a pre-sorted list").

use url::Url;

/// A single candidate: the full URL to request, plus the host used to key
/// [`mahoraga_ledger::StatisticsLedger`] lookups (the `Url`'s own host,
/// extracted once so `LoadBalancer` doesn't reparse on every comparison).
#[derive(Debug, Clone)]
struct Candidate {
    url: Url,
    host: String,
    /// Insertion order, used to break ties between equally-ranked hosts.
    order: usize,
}

/// A lazy, restartable-on-failure ordering over a set of candidate mirror
/// URLs for one request. Call [`LoadBalancer::next`] once per attempt; it
/// re-reads the ledger each time and returns the best URL not yet tried.
pub struct LoadBalancer {
    remaining: Vec<Candidate>,
}

impl LoadBalancer {
    /// Builds a balancer over `urls`. Non-absolute or host-less URLs are
    /// dropped — a route adapter that produces one is a bug, but the
    /// balancer itself degrades gracefully rather than panicking mid
    /// request.
    pub fn new(urls: impl IntoIterator<Item = Url>) -> Self {
        let remaining = urls
            .into_iter()
            .enumerate()
            .filter_map(|(order, url)| {
                let host = url.host_str()?.to_string();
                Some(Candidate { url, host, order })
            })
            .collect();
        Self { remaining }
    }

    /// Number of candidates not yet tried.
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }

    /// Selects and removes the best remaining candidate, ranked by
    /// `key_of(host)` ascending with insertion order breaking ties. Returns
    /// `None` once every candidate has been tried.
    ///
    /// A single-URL balancer always returns that URL on the first call
    /// regardless of `key_of`, matching spec.md §4.4 ("If the input is a
    /// single URL, it is yielded directly").
    pub fn next(&mut self, mut key_of: impl FnMut(&str) -> (bool, i64, f64)) -> Option<Url> {
        if self.remaining.len() == 1 {
            return self.remaining.pop().map(|candidate| candidate.url);
        }

        let mut best_index = None;
        let mut best_key: Option<(bool, i64, f64, usize)> = None;
        for (index, candidate) in self.remaining.iter().enumerate() {
            let (is_backup, concurrency, seconds) = key_of(&candidate.host);
            let key = (is_backup, concurrency, seconds, candidate.order);
            if best_key.as_ref().is_none_or(|current| key < *current) {
                best_key = Some(key);
                best_index = Some(index);
            }
        }

        best_index.map(|index| self.remaining.swap_remove(index).url)
    }
}

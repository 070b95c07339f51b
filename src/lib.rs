//! Multi-source scientific literature and grant search.
//!
//! Each external database is wrapped in a [`apis::PaperSource`] adapter and
//! driven through the same pipeline by [`search::Searcher`]: sanitize the
//! query, check the on-disk cache, rate-limit, fetch, validate, store and rank.

pub mod apis;
pub mod cache;
pub mod config;
pub mod fields;
pub mod ranking;
pub mod ratelimit;
pub mod relevance;
pub mod sanitize;
pub mod search;
pub mod topic;

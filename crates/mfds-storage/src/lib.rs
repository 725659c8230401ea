//! Paced HTTP fetch utilities + durable product storage for the MFDS tracker.

mod http;
mod products;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedPage,
    HttpClientConfig, HttpFetcher, RequestPacer, RetryDisposition, DEFAULT_USER_AGENT,
};
pub use products::{MemoryProductStore, PgProductStore, ProductStore, StoreError, MIGRATOR};

pub const CRATE_NAME: &str = "mfds-storage";

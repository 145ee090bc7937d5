//! Outbound GET requests over the connection pool

pub mod dispatcher;
pub mod query;

pub use dispatcher::{ClientConfig, DispatchError, HttpClient, Response};
pub use query::{encode, encode_pairs, url_encode, QueryError};

//! GBFS feed access: manifest discovery, sub-feed retrieval and payload decoding.
//!
//! - [`discovery`] - resolves `gbfs.json` into the station status and station
//!   information URLs
//! - [`fetcher`] - bounded HTTP retrieval of JSON documents
//! - [`parser`] - sub-feed payload types and their mapping into snapshot rows

mod discovery;
mod fetcher;
mod parser;

pub use discovery::{FeedDiscoverer, Manifest, SubFeedUrls};
pub use fetcher::{fetch_json, FeedError, FetchError, SchemaError};
pub use parser::{StationInformationFeed, StationStatusFeed, SubFeed};

pub mod service;

pub use service::{DataStore, SearchResults};

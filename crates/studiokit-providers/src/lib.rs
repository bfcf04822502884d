pub mod catalog;
pub mod download;
pub mod loopback;
pub mod ndjson;

#[cfg(any(test, feature = "test-util"))]
pub mod test_server;

pub use catalog::{ModelDescriptor, ModelFamily, ModelSource, CATALOG};
pub use download::Downloader;
pub use loopback::LoopbackClient;
pub use ndjson::NdjsonDecoder;

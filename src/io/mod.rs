//! Chunked array access: object stores, chunk cache and Zarr reading.

pub mod chunk_cache;
mod fetcher;
mod store;
mod zarr_reader;

pub use chunk_cache::{ChunkCache, ChunkKey, DecodedChunk};
pub use fetcher::ArrayFetcher;
pub use store::{create_anonymous_store, create_array_store, create_publish_store};
pub use zarr_reader::ChunkedArray;

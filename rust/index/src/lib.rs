pub mod backend;
pub mod backend_disk;
pub mod backend_memory;
pub mod backend_quantized;
pub mod counting_bitmap;
pub mod quantization;
pub mod result;
mod store;
mod types;
mod utils;

// Re-export the main surface at the crate root.

pub use backend::{
    full_table_scan_search, CompilingBackend, IndexBackend, ScannableBackend, VectorBackend,
    VectorGetter,
};
pub use backend_disk::DiskBackend;
pub use backend_memory::MemoryBackend;
pub use backend_quantized::QuantizedMemoryBackend;
pub use counting_bitmap::CountingBitmap;
pub use quantization::{Float16Quantization, NoQuantization, Quantization};
pub use result::{Neighbor, ResultSet};
pub use store::VectorStore;
pub use types::*;

pub mod chunker;
pub mod walker;

pub use chunker::{Chunk, chunk_file};
pub use walker::{detect_language, is_binary_path, walk_files};

pub mod chunker;
pub mod media;
pub mod parser;

pub use chunker::{DocumentChunk, TextChunker};
pub use media::{inspect_image, ImageInfo};
pub use parser::{DocumentParser, ParsedDocument};

pub mod chunker;
pub mod content_type;
pub mod parser;
pub mod processor;

pub use chunker::{Chunker, ChunkerConfig, TextChunk};
pub use content_type::resolve_content_type;
pub use parser::{ExtractedImage, FileParser, ParsedFile, ParserFactory};
pub use processor::{ChunkAnnotation, DomainProcessor, ProcessedDocument, ProcessorFactory};

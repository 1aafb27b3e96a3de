pub mod chat;
pub mod embedding;
pub mod speech;
pub mod vision;

pub use chat::{ChatMessage, ChatModel, GenerationParams, OpenAiChatModel, TokenStream};
pub use embedding::{Embedder, HttpEmbedder};
pub use speech::{HttpSpeech, SpeechPort, Transcript};
pub use vision::{HttpVision, VisionDescription, VisionPort};

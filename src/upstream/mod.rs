pub mod client;
pub mod parser;

pub use client::{ByteStream, GenerationBackend, RagClient, UpstreamQuery};
pub use parser::{UpstreamEvent, UpstreamEventParser};

pub mod flusher;

pub use flusher::Flusher;

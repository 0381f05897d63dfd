//! Piece cache engine
//!
//! Holds the pieces of each streamed torrent in bounded memory or on disk,
//! evicts pieces outside every reader's window once a cache is over capacity,
//! and feeds reader positions back into the transfer engine's piece priorities.

pub mod cache;
pub mod piece;
pub mod range;
pub mod reader;
pub mod registry;
pub mod state;

pub use cache::Cache;
pub use piece::{Piece, PieceIo};
pub use range::{PieceWindow, in_windows, merge_windows};
pub use reader::{Reader, ReaderId};
pub use registry::CacheRegistry;
pub use state::{CacheState, ItemState, ReaderState};

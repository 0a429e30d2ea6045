pub mod activity;
pub mod config;
pub mod engine;
pub mod error;
pub mod leaderboard;
pub mod output;
pub mod scoring;

pub use engine::Engine;
pub use error::{RankError, Result};

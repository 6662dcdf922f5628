pub mod config;
pub mod controller;
pub mod curation;
pub mod error;
pub mod leaderboard;
pub mod mapping;
pub mod matcher;
pub mod render;
pub mod section;
pub mod terms;
pub mod wiki;

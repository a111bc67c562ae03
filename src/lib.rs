pub mod auth;
pub mod clock;
pub mod config;
pub mod directory;
pub mod engine;
pub mod limits;
pub mod messaging;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod report;
pub mod state;
pub mod store;
pub mod view;
pub mod wal;

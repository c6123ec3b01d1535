pub mod bot;
pub mod catalog;
pub mod config;
pub mod drive;
pub mod health;
pub mod hydrax;
pub mod messaging;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod render;
pub mod retry;
pub mod stage;
pub mod supervisor;
pub mod telegram;
pub mod util;

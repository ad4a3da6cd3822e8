pub mod api;
pub mod credential;
pub mod db;
pub mod error;
pub mod limiter;
pub mod schema;
pub mod settings;
pub mod utils;
pub mod web;

pub use web::AppState;

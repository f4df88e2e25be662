pub mod message;
pub mod types;
pub mod user;

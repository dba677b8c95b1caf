pub mod connection_state;
pub mod models;
pub mod settings;

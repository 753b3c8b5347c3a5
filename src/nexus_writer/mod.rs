pub mod config;
pub mod filesink;
pub mod hdf;
pub mod kafka;
pub mod modules;
pub mod msg;
pub mod schema;
pub mod server;
pub mod stream;
pub mod time;

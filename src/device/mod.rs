pub mod connection;
pub mod constants;
pub mod decoder;
pub mod link;
pub mod radio;
pub mod selection;
pub mod transport;
pub mod types;

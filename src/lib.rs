pub mod audio;
pub mod capture;
pub mod client;
pub mod config;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod tools;

pub use client::{ClientConfig, ClientEvent, ConnectionState, LiveClient};
pub use error::{LiveError, Result};

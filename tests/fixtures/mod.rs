//! Reusable end-to-end fixtures.

pub mod directory;
pub mod node;

pub use directory::DirectoryHub;
pub use node::{Node, drive, send_to_client, send_to_host, test_config};

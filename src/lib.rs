pub mod config;
pub mod context;
pub mod core;
pub mod db;
pub mod error;
pub mod logging;
pub mod remote;

pub use error::{ErrorKind, Result, TransferError};

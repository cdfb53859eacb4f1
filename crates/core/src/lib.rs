pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod hash;
pub mod models;
pub mod probe;
pub mod recover;
pub mod replace;
pub mod scan;
pub mod stop;
pub mod worker;

pub use crate::error::{Error, Result};
pub use crate::models::*;

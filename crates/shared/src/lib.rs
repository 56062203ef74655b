pub mod domain;
pub mod error;
pub mod local;
pub mod protocol;

//! CLI Commands

pub mod image;
pub mod machine;

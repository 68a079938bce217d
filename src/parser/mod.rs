// Parser module for converge plays

pub mod ast;
pub mod yaml;

pub use ast::*;
pub use yaml::{parse_plays, parse_plays_file};

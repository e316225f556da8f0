//! Pipeline YAML configuration: types, parsing, validation and backend
//! construction.

pub mod backends;
pub mod parser;
pub mod types;
pub mod validator;

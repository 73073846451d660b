mod config;
mod grammar;
mod parser;

pub use config::parse_template_config;
pub use parser::parse_timeout_spec;

mod parse;
mod toml;

pub use parse::{Opts, parse_opts};
pub use toml::{ConfigToml, RouteServiceToml, RouteToml};

use anyhow::ensure;
use clap::{Arg, ArgMatches, Command};
use std::path::Path;

/// Command line options
pub struct Opts {
  /// Path to the TOML configuration file
  pub config_file_path: String,
  /// Directory for log files; logs go to stdout when unset
  pub log_dir_path: Option<String>,
}

fn command() -> Command {
  clap::command!()
    .arg(
      Arg::new("config_file")
        .long("config")
        .short('c')
        .value_name("FILE")
        .required(true)
        .help("TOML configuration file, e.g. ./hostrouter.toml"),
    )
    .arg(
      Arg::new("log_dir")
        .long("log-dir")
        .short('l')
        .value_name("DIR")
        .help("Write log files under this directory instead of stdout"),
    )
}

/// Parse arg values passed from cli
pub fn parse_opts() -> Result<Opts, anyhow::Error> {
  let opts = Opts::from(&command().get_matches());
  ensure!(
    Path::new(&opts.config_file_path).is_file(),
    "configuration file not found: {}",
    opts.config_file_path
  );
  Ok(opts)
}

impl From<&ArgMatches> for Opts {
  fn from(matches: &ArgMatches) -> Self {
    let config_file_path = matches
      .get_one::<String>("config_file")
      .cloned()
      .unwrap_or_default();
    let log_dir_path = matches.get_one::<String>("log_dir").cloned();
    Self {
      config_file_path,
      log_dir_path,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_config_option_is_required() {
    assert!(command().try_get_matches_from(["hostrouter"]).is_err());
  }

  #[test]
  fn test_options_are_parsed() {
    let matches = command()
      .try_get_matches_from(["hostrouter", "-c", "router.toml", "--log-dir", "/var/log"])
      .unwrap();
    let opts = Opts::from(&matches);
    assert_eq!(opts.config_file_path, "router.toml");
    assert_eq!(opts.log_dir_path.as_deref(), Some("/var/log"));
  }
}

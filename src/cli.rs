use {
  bgp_sentry::config::Config,
  clap::Parser,
  std::path::PathBuf,
};

#[derive(Debug, Parser)]
#[clap(version, about)]
pub struct CliOpts {
  #[clap(
    short,
    long,
    help = "dataset directory holding roster.json, vrp.json and observations/"
  )]
  pub dataset: String,

  #[clap(
    short = 'o',
    long,
    help = "data directory for persistent chain replicas; in-memory if omitted"
  )]
  pub data_dir: Option<String>,

  #[clap(short, long, help = "configuration file (JSON)")]
  pub config: Option<String>,

  #[clap(
    short,
    long,
    help = "simulation speed multiplier override (0 = as fast as possible)"
  )]
  pub speed: Option<f64>,

  #[clap(
    short,
    long,
    parse(from_occurrences),
    help = "Use verbose output (-vv very verbose output)"
  )]
  pub verbose: u64,
}

impl CliOpts {
  pub fn dataset_dir(&self) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&self.dataset).into_owned())
  }

  pub fn data_dir(&self) -> Option<PathBuf> {
    self
      .data_dir
      .as_ref()
      .map(|dir| PathBuf::from(shellexpand::tilde(dir).into_owned()))
  }

  /// The run configuration: the given file or defaults, with the
  /// command-line speed override applied on top.
  pub fn config(&self) -> anyhow::Result<Config> {
    let mut config = match &self.config {
      Some(path) => {
        Config::load(shellexpand::tilde(path).into_owned())?
      }
      None => Config::default(),
    };
    if let Some(speed) = self.speed {
      config.speed_multiplier = speed;
    }
    Ok(config)
  }
}

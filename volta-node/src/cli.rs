use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "volta-node")]
#[command(about = "Runs poll rounds against a simulated validator set")]
pub struct Args {
    /// Path to the JSON config. Created with defaults if missing.
    #[arg(long = "config", value_name = "FILE", default_value = "config.json")]
    pub config_path: String,

    /// Overrides the number of poll rounds from the config.
    #[arg(long)]
    pub rounds: Option<usize>,

    /// Directory for the consensus audit log.
    #[arg(long, value_name = "DIR", default_value = "logs")]
    pub log_dir: String,
}

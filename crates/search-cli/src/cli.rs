use std::path::PathBuf;

use clap::Parser;
use reqwest::Url;

pub fn default_parallel() -> u16 {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(512) as u16
}

fn parse_threshold(input: &str) -> Result<f64, String> {
    let value: f64 = input
        .trim()
        .parse()
        .map_err(|_| format!("invalid threshold: {input:?}"))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("threshold must be within [0, 1], got {value}"));
    }
    Ok(value)
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "pdbsim",
    version,
    about = "Cascading protein structure similarity search"
)]
pub struct Cli {
    /// Query chain (`1ABC:A`) or structure entry (`1ABC`).
    pub query: String,

    /// Chain of the entry to search with (defaults to the first usable chain).
    #[arg(long)]
    pub chain: Option<String>,

    /// Minimum Q-score of reported candidates.
    #[arg(
        short = 't',
        long,
        env = "PDBSIM_THRESHOLD",
        default_value_t = 0.5,
        value_parser = parse_threshold
    )]
    pub threshold: f64,

    /// Candidates requested from every search phase.
    #[arg(
        short = 'k',
        long,
        env = "PDBSIM_NUM_RESULTS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub num_results: u32,

    #[arg(long, env = "PDBSIM_NO_VISUALIZATIONS", default_value_t = false)]
    pub no_visualizations: bool,

    #[arg(long, env = "PDBSIM_NO_SEARCH_STATS", default_value_t = false)]
    pub no_search_stats: bool,

    /// Overrides `backend_url` of the config file.
    #[arg(long, env = "PDBSIM_BACKEND_URL")]
    pub backend_url: Option<Url>,

    /// Streaming loop cadence in milliseconds.
    #[arg(
        long,
        env = "PDBSIM_TICK_MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(10..)
    )]
    pub tick_ms: u64,

    /// Number of search and alignment tasks running in parallel.
    #[arg(
        short = 'p',
        long,
        env = "PDBSIM_PARALLEL",
        default_value_t = default_parallel(),
        value_parser = clap::value_parser!(u16).range(1..=512)
    )]
    pub parallel: u16,

    /// Config file (defaults to `$XDG_CONFIG_HOME/pdbsim/config.json`).
    #[arg(long, env = "PDBSIM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Structure store snapshot; overrides `store_snapshot` of the config file.
    #[arg(long, env = "PDBSIM_STORE")]
    pub store: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let cli = Cli::try_parse_from(["pdbsim", "1ABC:A"]).unwrap();
        assert_eq!(cli.query, "1ABC:A");
        assert_eq!(cli.threshold, 0.5);
        assert_eq!(cli.num_results, 30);
        assert_eq!(cli.tick_ms, 1000);
        assert!(!cli.no_visualizations);
        assert!(cli.backend_url.is_none());
    }

    #[test]
    fn threshold_out_of_range_is_rejected() {
        assert!(Cli::try_parse_from(["pdbsim", "--threshold", "1.2", "1ABC"]).is_err());
        assert!(Cli::try_parse_from(["pdbsim", "--threshold", "abc", "1ABC"]).is_err());
    }

    #[test]
    fn zero_results_is_rejected() {
        assert!(Cli::try_parse_from(["pdbsim", "-k", "0", "1ABC"]).is_err());
    }
}

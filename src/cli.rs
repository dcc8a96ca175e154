use std::path::PathBuf;
use structopt::StructOpt;

/// sudo event and I/O log server
#[derive(Debug, StructOpt)]
#[structopt(name = "sudo_logsrvd")]
pub struct Cli {
    /// Path to the configuration file
    #[structopt(short = "f", long = "file", parse(from_os_str))]
    pub file: Option<PathBuf>,

    /// Run in the foreground and do not write a pid file
    #[structopt(short = "n", long = "no-fork")]
    pub no_fork: bool,

    /// Percent chance connections will drop on each I/O buffer (debugging aid)
    #[structopt(short = "R", long = "random-drop")]
    pub random_drop: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_and_long_flags() {
        let cli = Cli::from_iter(&["sudo_logsrvd", "-n", "-f", "/tmp/conf", "-R", "2.5"]);
        assert!(cli.no_fork);
        assert_eq!(cli.file, Some(PathBuf::from("/tmp/conf")));
        assert_eq!(cli.random_drop, Some(2.5));

        let cli = Cli::from_iter(&["sudo_logsrvd"]);
        assert!(!cli.no_fork);
        assert!(cli.file.is_none());
        assert!(cli.random_drop.is_none());
    }
}

use {anyhow::Context, std::fs, std::io::Write as _, std::path::Path, structopt::StructOpt};

use sudo_logsrvd::{cli::Cli, config::Config, defaults, server::Server};

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::from_args();

    let random_drop = match cli.random_drop {
        Some(percent) if (0.0..=100.0).contains(&percent) => percent / 100.0,
        Some(percent) => anyhow::bail!("invalid random drop value: {}", percent),
        None => 0.0,
    };

    let config_path = cli
        .file
        .unwrap_or_else(|| defaults::CONFIG_FILE.into());
    let config = Config::load(&config_path).await.with_context(|| {
        format!(
            "could not load server configuration from {}",
            config_path.display()
        )
    })?;

    let pid_file = if cli.no_fork {
        None
    } else {
        config.server.pid_file.clone()
    };
    if let Some(path) = &pid_file {
        write_pid_file(path).with_context(|| format!("could not write {}", path.display()))?;
    }

    let result = Server::new(config, &config_path, random_drop)
        .run(std::future::pending::<()>())
        .await;

    if let Some(path) = &pid_file {
        let _ = fs::remove_file(path);
    }
    result?;

    // A normal return from the serve loop exits 1; only -V and -h exit 0.
    std::process::exit(1);
}

/// Write the process ID, typically to /var/run/sudo/sudo_logsrvd.pid,
/// creating parent directories as needed.
fn write_pid_file(path: &Path) -> Result<(), anyhow::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}

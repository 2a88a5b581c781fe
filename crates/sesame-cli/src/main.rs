use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sesame_hw::{GpioOutputLine, Level, OutputLine};

#[derive(Parser)]
#[command(name = "sesame", about = "Sesame access agent CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show agent status
    Status,
    /// List enrolled identities known to the agent
    List,
    /// Ask the agent to run a sync cycle now
    Sync,
    /// Pulse the lock line directly, bypassing the agent (bring-up tool)
    TestLock {
        /// GPIO chip device path
        #[arg(long, default_value = "/dev/gpiochip0")]
        chip: String,
        /// Line offset driving the lock
        #[arg(long, default_value_t = 17)]
        pin: u32,
        /// Pulse duration in milliseconds
        #[arg(long, default_value_t = 800)]
        pulse_ms: u64,
    },
    /// Fetch a sync payload from the authority and print a summary
    ProbeSync {
        /// Authority base URL
        #[arg(long)]
        url: String,
        #[arg(long, default_value = "sesame-cli")]
        device_id: String,
        #[arg(long)]
        token: Option<String>,
    },
}

#[zbus::proxy(
    interface = "org.sesame.Agent1",
    default_service = "org.sesame.Agent1",
    default_path = "/org/sesame/Agent1"
)]
trait Agent {
    fn status(&self) -> zbus::Result<String>;
    fn list_enrollments(&self) -> zbus::Result<String>;
    fn sync_now(&self) -> zbus::Result<bool>;
}

async fn agent() -> Result<AgentProxy<'static>> {
    let connection = match zbus::Connection::system().await {
        Ok(connection) => connection,
        Err(_) => zbus::Connection::session()
            .await
            .context("sesamed not reachable on system or session bus")?,
    };
    AgentProxy::new(&connection)
        .await
        .context("failed to create agent proxy")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let raw = agent().await?.status().await?;
            let status: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::List => {
            let raw = agent().await?.list_enrollments().await?;
            let entries: serde_json::Value = serde_json::from_str(&raw)?;
            let Some(entries) = entries.as_array() else {
                anyhow::bail!("unexpected response: {raw}");
            };
            if entries.is_empty() {
                println!("No enrollments");
            }
            for entry in entries {
                println!(
                    "{}  rev {}  {}  {}",
                    entry["identity_id"].as_str().unwrap_or("?"),
                    entry["revision"],
                    entry["updated_at"].as_str().unwrap_or("?"),
                    entry["display_name"].as_str().unwrap_or("?"),
                );
            }
        }
        Commands::Sync => {
            if agent().await?.sync_now().await? {
                println!("Sync requested");
            } else {
                println!("Sync already pending");
            }
        }
        Commands::TestLock { chip, pin, pulse_ms } => {
            println!("Pulsing {chip} line {pin} for {pulse_ms}ms (locked -> unlocked -> locked)");
            let line = GpioOutputLine::open(&chip, pin, "sesame-test", Level::Active)
                .context("failed to request lock line")?;
            line.set(Level::Inactive)?;
            tokio::time::sleep(std::time::Duration::from_millis(pulse_ms)).await;
            line.set(Level::Active)?;
            println!("Done, line left at locked level");
        }
        Commands::ProbeSync { url, device_id, token } => {
            let mut request = reqwest::Client::new()
                .get(format!("{}/agent/sync", url.trim_end_matches('/')))
                .header("X-Device-Id", &device_id);
            if let Some(token) = &token {
                request = request.bearer_auth(token);
            }
            let payload: serde_json::Value = request
                .send()
                .await
                .context("sync request failed")?
                .error_for_status()
                .context("authority returned an error")?
                .json()
                .await
                .context("malformed sync payload")?;

            println!("version: {}", payload["version"]);
            let records = payload["records"].as_array().cloned().unwrap_or_default();
            println!("records: {}", records.len());
            for record in records {
                println!(
                    "  {}  rev {}  dim {}",
                    record["identity_id"].as_str().unwrap_or("?"),
                    record["revision"],
                    record["embedding"]["values"]
                        .as_array()
                        .map(|v| v.len())
                        .unwrap_or(0),
                );
            }
        }
    }

    Ok(())
}

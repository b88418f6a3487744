use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.likeness.Likeness1",
    default_service = "org.likeness.Likeness1",
    default_path = "/org/likeness/Likeness1"
)]
trait Likeness {
    fn register(&self, name: &str, image: &[u8]) -> zbus::Result<String>;
    fn analyze(&self, image: &[u8]) -> zbus::Result<String>;
    fn list_faces(&self) -> zbus::Result<String>;
    fn remove_face(&self, name: &str) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "likeness", about = "Likeness face registry and analysis CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a face photo under a display name
    Register {
        /// Display name for this person
        #[arg(short, long)]
        name: String,
        /// Photo containing exactly the face to register
        image: PathBuf,
    },
    /// Detect, classify emotion and recognize a face photo
    Analyze {
        image: PathBuf,
    },
    /// List registered faces
    List,
    /// Remove a registered face by display name
    Remove {
        name: String,
    },
    /// Show daemon status
    Status,
    /// Print a freshly derived encryption key
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Register { name, image } => {
            let bytes = read_image(&image)?;
            let proxy = connect(cli.system).await?;
            print_json(&proxy.register(&name, &bytes).await?)?;
        }
        Commands::Analyze { image } => {
            let bytes = read_image(&image)?;
            let proxy = connect(cli.system).await?;
            print_json(&proxy.analyze(&bytes).await?)?;
        }
        Commands::List => {
            let proxy = connect(cli.system).await?;
            print_json(&proxy.list_faces().await?)?;
        }
        Commands::Remove { name } => {
            let proxy = connect(cli.system).await?;
            if proxy.remove_face(&name).await? {
                println!("Removed {name}");
            } else {
                println!("No registered face named {name}");
            }
        }
        Commands::Status => {
            let proxy = connect(cli.system).await?;
            print_json(&proxy.status().await?)?;
        }
        Commands::Keygen => {
            // Offline: the daemon is not involved.
            let key = likeness_vault::key::generate_key();
            println!("{}={}", likeness_vault::KEY_ENV_VAR, key.encode());
        }
    }

    Ok(())
}

async fn connect(system: bool) -> Result<LikenessProxy<'static>> {
    let connection = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    LikenessProxy::new(&connection)
        .await
        .context("likenessd is not reachable")
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

//! Riot client discovery and launch sequencing.
//!
//! The game client is never modified; it is simply restarted with
//! `--client-config-url` pointing at the config interceptor. Any already
//! running client has to go first, since it would hold the chat connection
//! we want to intercept.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::ValueEnum;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{info, warn};

/// Which product to ask the Riot client to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GameProduct {
    #[value(name = "lol")]
    LeagueOfLegends,
    #[value(name = "valorant")]
    Valorant,
    #[value(name = "lor")]
    LegendsOfRuneterra,
    #[value(name = "lion")]
    Lion,
    #[value(name = "riot-client")]
    RiotClient,
    #[value(name = "prompt")]
    Prompt,
}

impl GameProduct {
    /// The `--launch-product` code, when the product takes one.
    /// `RiotClient` and `Prompt` launch the plain client home screen.
    pub fn product_code(self) -> Option<&'static str> {
        match self {
            GameProduct::LeagueOfLegends => Some("league_of_legends"),
            GameProduct::Valorant => Some("valorant"),
            GameProduct::LegendsOfRuneterra => Some("bacon"),
            GameProduct::Lion => Some("lion"),
            GameProduct::RiotClient | GameProduct::Prompt => None,
        }
    }

    pub fn from_setting(name: &str) -> Option<Self> {
        Self::from_str(name, true).ok()
    }
}

/// Process name stems of the Riot client and its games. Anything matching
/// one of these is stopped before relaunch.
const RIOT_PROCESS_STEMS: [&str; 6] = [
    "RiotClientServices",
    "RiotClientUx",
    "LeagueClient",
    "LeagueClientUx",
    "LeagueofLegends",
    "VALORANT",
];

/// Locate the Riot client binary on this machine.
#[cfg(target_os = "windows")]
pub fn find_client() -> anyhow::Result<PathBuf> {
    use serde_json::Value;
    use tracing::debug;

    let program_data =
        std::env::var("ALLUSERSPROFILE").unwrap_or_else(|_| r"C:\ProgramData".to_string());
    let installs_path = PathBuf::from(program_data)
        .join("Riot Games")
        .join("RiotClientInstalls.json");
    let raw = std::fs::read_to_string(&installs_path).with_context(|| {
        format!(
            "reading {} (is the Riot client installed?)",
            installs_path.display()
        )
    })?;
    let installs: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", installs_path.display()))?;

    for key in ["rc_default", "rc_live", "rc_beta"] {
        if let Some(path) = installs.get(key).and_then(Value::as_str) {
            let path = PathBuf::from(path);
            if path.exists() {
                debug!(key, path = %path.display(), "found Riot client install");
                return Ok(path);
            }
        }
    }
    bail!(
        "no usable Riot client install listed in {}",
        installs_path.display()
    )
}

#[cfg(target_os = "macos")]
pub fn find_client() -> anyhow::Result<PathBuf> {
    let path =
        PathBuf::from("/Applications/Riot Client.app/Contents/MacOS/RiotClientServices");
    if path.exists() {
        return Ok(path);
    }
    bail!("Riot client not found at {}", path.display())
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub fn find_client() -> anyhow::Result<PathBuf> {
    bail!("the Riot client does not run natively on this platform")
}

/// Stop every running Riot client and game process, waiting briefly for
/// them to exit so the relaunch does not race the old instance.
pub fn stop_running_clients() {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing(),
    );

    let mut killed = 0usize;
    for process in system.processes().values() {
        let name = process.name().to_string_lossy();
        if RIOT_PROCESS_STEMS
            .iter()
            .any(|stem| name.starts_with(stem))
        {
            info!(name = %name, pid = process.pid().as_u32(), "stopping running Riot process");
            if !process.kill() {
                warn!(name = %name, "failed to stop process");
            }
            killed += 1;
        }
    }

    if killed > 0 {
        // Give the OS a moment to tear the processes down.
        std::thread::sleep(Duration::from_millis(2000));
    }
}

/// Launch the Riot client pointed at the config interceptor.
pub fn launch_client(
    client: &Path,
    game: GameProduct,
    patchline: &str,
    config_port: u16,
) -> anyhow::Result<()> {
    let mut command = Command::new(client);
    command.arg(format!("--client-config-url=http://127.0.0.1:{config_port}"));
    if let Some(code) = game.product_code() {
        command.arg(format!("--launch-product={code}"));
        command.arg(format!("--launch-patchline={patchline}"));
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    info!(client = %client.display(), game = ?game, patchline, config_port, "launching Riot client");
    command
        .spawn()
        .with_context(|| format!("launching {}", client.display()))?;
    Ok(())
}

/// Resolve the `prompt` pseudo-product: ask on stdin, falling back to the
/// persisted default and finally the plain client.
pub fn resolve_prompt(default_game: &str) -> GameProduct {
    if let Some(game) = GameProduct::from_setting(default_game) {
        if game != GameProduct::Prompt {
            info!(game = ?game, "using default game from settings");
            return game;
        }
    }

    eprintln!("Which game should be launched? [lol/valorant/lor/lion/riot-client]");
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_ok() {
        if let Some(game) = GameProduct::from_setting(answer.trim()) {
            if game != GameProduct::Prompt {
                return game;
            }
        }
        warn!(answer = %answer.trim(), "unrecognized game, launching the plain Riot client");
    }
    GameProduct::RiotClient
}

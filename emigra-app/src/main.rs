//! Emigra headless host.
//!
//! ```text
//! emigra voice     [--lang <code>] [--device <name>]   live voice interview
//! emigra chat      [--lang <code>]                     text interview on stdin
//! emigra devices                                       list input devices
//! emigra languages                                     list interview languages
//! emigra settings  [--lang <code>] [--device <name>] [--save]
//! ```
//!
//! `--settings <path>` overrides the settings file location. Logs go to
//! stderr (`RUST_LOG`, default `emigra=info`); events go to stdout.

mod commands;
mod settings;

use std::path::PathBuf;

use anyhow::{bail, Context};
use emigra_core::Language;
use settings::{default_settings_path, load_settings, save_settings};
use tracing::info;

const USAGE: &str = "usage: emigra <voice|chat|devices|languages|settings> \
                     [--lang <code>] [--device <name>] [--settings <path>] [--save]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Voice,
    Chat,
    Devices,
    Languages,
    Settings,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliArgs {
    command: Command,
    language: Option<String>,
    device: Option<String>,
    settings_path: Option<PathBuf>,
    save: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<CliArgs> {
    let mut args = args.into_iter();
    let command = match args.next().as_deref() {
        Some("voice") => Command::Voice,
        Some("chat") => Command::Chat,
        Some("devices") => Command::Devices,
        Some("languages") => Command::Languages,
        Some("settings") => Command::Settings,
        None | Some("help" | "-h" | "--help") => Command::Help,
        Some(other) => bail!("unknown command {other:?}\n{USAGE}"),
    };

    let mut parsed = CliArgs {
        command,
        language: None,
        device: None,
        settings_path: None,
        save: false,
    };
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--lang" => parsed.language = Some(args.next().context("--lang needs a value")?),
            "--device" => parsed.device = Some(args.next().context("--device needs a value")?),
            "--settings" => {
                parsed.settings_path =
                    Some(PathBuf::from(args.next().context("--settings needs a value")?))
            }
            "--save" => parsed.save = true,
            other => bail!("unknown flag {other:?}\n{USAGE}"),
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("emigra=info")),
        )
        .init();

    let cli = parse_args(std::env::args().skip(1))?;
    if cli.command == Command::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let settings_path = cli.settings_path.clone().unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    info!(path = %settings_path.display(), "settings loaded");

    if let Some(code) = &cli.language {
        settings.language = code.clone();
    }
    if let Some(device) = &cli.device {
        settings.preferred_input_device = Some(device.clone());
    }
    settings.normalize();
    if cli.save {
        save_settings(&settings_path, &settings)
            .with_context(|| format!("saving {}", settings_path.display()))?;
        info!("settings saved");
    }

    let language: Language = settings.language();
    match cli.command {
        Command::Voice => commands::run_voice(&settings, language).await,
        Command::Chat => commands::run_chat(&settings, language).await,
        Command::Devices => commands::list_devices(),
        Command::Languages => commands::list_languages(),
        Command::Settings => commands::show_settings(&settings),
        Command::Help => Ok(()),
    }
}

//! Host command handlers.
//!
//! Each handler prints its results to stdout as JSON lines, the same payloads
//! a presentation shell would receive.

use anyhow::Context;
use emigra_core::{
    audio::device::list_input_devices,
    engine::SessionOutcome,
    language::LANGUAGES,
    ChatReply, CpalBackend, EvaluatorChat, Language, LiveConnector, VoiceEngine, VoiceEvent,
};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::settings::AppSettings;

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Run one live voice interview until it completes, fails, or Ctrl-C closes it.
pub async fn run_voice(settings: &AppSettings, language: Language) -> anyhow::Result<()> {
    let config = settings.engine_config(settings.resolve_api_key());
    let engine = VoiceEngine::new(config, CpalBackend::new(), LiveConnector::new());
    let (handle, mut events) = engine.start(language)?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    print_json(&event)?;
                    if event == VoiceEvent::Close {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if handle.is_live() => {
                info!("interrupt received, closing session");
                handle.close();
            }
        }
    }

    let outcome = handle.wait().await;
    info!(diagnostics = ?engine.diagnostics_snapshot(), "voice session finished");
    match outcome {
        SessionOutcome::Failed(category) => anyhow::bail!("voice session failed: {category:?}"),
        SessionOutcome::Completed(_) | SessionOutcome::Closed => Ok(()),
    }
}

/// Text interview on stdin/stdout. Ends at the evaluation or end of input.
pub async fn run_chat(settings: &AppSettings, language: Language) -> anyhow::Result<()> {
    let api_key = settings
        .resolve_api_key()
        .context("no API key configured (set EMIGRA_API_KEY or apiKey in settings.json)")?;
    let mut chat = EvaluatorChat::new(settings.chat_config(api_key), language)?;
    println!("{}", chat.greeting());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match chat.send(&line).await {
            Ok(Some(ChatReply::Text(text))) => println!("{text}"),
            Ok(Some(ChatReply::Completed(result))) => {
                print_json(&result)?;
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => {
                warn!("chat turn failed: {e}");
                eprintln!("Sorry, something went wrong. Please try again.");
            }
        }
    }
    info!("chat input closed before an evaluation");
    Ok(())
}

pub fn list_devices() -> anyhow::Result<()> {
    print_json(&list_input_devices())
}

pub fn list_languages() -> anyhow::Result<()> {
    print_json(LANGUAGES)
}

pub fn show_settings(settings: &AppSettings) -> anyhow::Result<()> {
    print_json(&settings.runtime_settings())
}

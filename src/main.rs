use anyhow::Context;
use clap::Parser;
use live_agent::{
    capture::{CaptureConfig, CapturePipeline, CpalInput},
    config::{load_config, Endpoint, DEFAULT_MODEL},
    playback::{CpalOutput, PlaybackConfig, PlaybackScheduler, VolumeMeter},
    protocol::{FunctionCall, Modality, Part, SessionConfig},
    tools::{register_note_tools, NoteStore, ToolRegistry},
    ClientConfig, ClientEvent, ConnectionState, LiveClient, LiveError,
};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Talk to a realtime multimodal model from the terminal: microphone in, speaker out, typed
/// lines sent as text turns.
#[derive(Parser, Debug)]
#[command(name = "live-agent", version)]
struct Args {
    /// Model to open the session with
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Prebuilt voice for audio responses (e.g. Aoede, Puck)
    #[arg(long)]
    voice: Option<String>,

    #[arg(long)]
    system_instruction: Option<String>,

    /// Response modality: audio or text
    #[arg(long, default_value = "audio")]
    modality: Modality,

    /// Do not open the microphone; type instead
    #[arg(long)]
    no_mic: bool,

    /// JSON file backing the saveNote/getNotes tools
    #[arg(long, default_value = "notes.json")]
    notes_file: PathBuf,

    /// Connect through a credential-injecting relay instead of the default endpoint
    #[arg(long)]
    endpoint: Option<String>,

    /// Input device (substring match)
    #[arg(long)]
    input_device: Option<String>,

    /// Output device (substring match)
    #[arg(long)]
    output_device: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    log::info!("🚀 Initializing live-agent");

    let endpoint = match &args.endpoint {
        Some(url) => Endpoint::relay(url).context("Invalid --endpoint")?,
        None => load_config()?.endpoint,
    };

    let playback = PlaybackScheduler::new(
        PlaybackConfig::default(),
        CpalOutput::new(args.output_device.clone()),
    );
    let (meter, mut output_level) = VolumeMeter::new();
    playback.register_tap(meter);

    let mut registry = ToolRegistry::new();
    register_note_tools(&mut registry, Arc::new(NoteStore::new(&args.notes_file)));
    let registry = Arc::new(registry);

    let mut session = SessionConfig::new(&args.model).with_modality(args.modality);
    if let Some(voice) = &args.voice {
        session = session.with_voice(voice);
    }
    if let Some(instruction) = &args.system_instruction {
        session = session.with_system_instruction(instruction);
    }
    if let Some(tool) = registry.as_tool() {
        session = session.with_tool(tool);
    }

    let (client, mut events) = LiveClient::new(ClientConfig::default(), Arc::new(playback.clone()));
    client
        .open(&endpoint, session)
        .await
        .context("Failed to open session")?;
    tokio::time::timeout(SETUP_TIMEOUT, client.wait_for_state(ConnectionState::Active))
        .await
        .context("Timed out waiting for setupComplete")??;

    let microphone = if args.no_mic {
        None
    } else {
        let pipeline = CapturePipeline::new(
            CaptureConfig::default(),
            CpalInput::new(args.input_device.clone()),
        );
        match client.start_capture(&pipeline) {
            Ok(()) => {
                log::info!("🎤 Microphone streaming");
                Some(pipeline)
            }
            Err(e) => {
                println!("⚠️  Microphone unavailable ({}), continuing with text input", e);
                None
            }
        }
    };

    println!("🎧 Session ready. Type a message and press Enter, or just talk.");
    println!("   Press Ctrl+C to exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut meter_open = true;
    let mut running_calls: HashMap<String, CancellationToken> = HashMap::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ClientEvent::Open => log::debug!("Session open"),
                    ClientEvent::Close(reason) => {
                        println!("\n🔌 Connection closed: {}", reason);
                        break;
                    }
                    ClientEvent::Error(detail) => println!("\n❌ {}", detail),
                    ClientEvent::Audio(pcm) => log::trace!("Audio chunk: {} bytes", pcm.len()),
                    ClientEvent::Content(part) => print_part(&part),
                    ClientEvent::Interrupted => println!("\n🛑 Interrupted"),
                    ClientEvent::TurnComplete => println!(),
                    ClientEvent::ToolCall(calls) => {
                        running_calls.retain(|_, token| !token.is_cancelled());
                        for call in calls {
                            let token = CancellationToken::new();
                            running_calls.insert(call.id.clone(), token.clone());
                            spawn_tool_call(client.clone(), Arc::clone(&registry), call, token);
                        }
                    }
                    ClientEvent::ToolCallCancellation(ids) => {
                        for id in ids {
                            if let Some(token) = running_calls.remove(&id) {
                                log::info!("Cancelling tool call {}", id);
                                token.cancel();
                            }
                        }
                    }
                    ClientEvent::Log(entry) => {
                        let repeats = entry.count.map(|c| format!(" (x{})", c)).unwrap_or_default();
                        log::debug!("[{}] {}{}", entry.tag, entry.message, repeats);
                    }
                }
            }

            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if let Err(e) = client.send_content(vec![Part::text(line.trim())], true) {
                        println!("❌ Could not send: {}", e);
                    }
                }
                Ok(None) => {
                    log::info!("stdin closed");
                    stdin_open = false;
                }
                Err(e) => {
                    log::error!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },

            changed = output_level.changed(), if meter_open => match changed {
                Ok(()) => log::trace!("Output level {:.3}", *output_level.borrow()),
                Err(_) => meter_open = false,
            },

            _ = tokio::signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    for token in running_calls.values() {
        token.cancel();
    }
    client.close().await;
    drop(microphone);

    println!("\n👋 Goodbye!");
    Ok(())
}

fn print_part(part: &Part) {
    match part {
        Part::Text(text) => {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
        Part::ExecutableCode(code) => println!("\n```{}\n{}\n```", code.language.to_lowercase(), code.code),
        Part::CodeExecutionResult(result) => println!("\n[{}] {}", result.outcome, result.output),
        Part::InlineData(blob) => log::debug!("Inline {} ({} bytes)", blob.mime_type, blob.data.len()),
        Part::Other(value) => log::debug!("Unhandled part: {}", value),
    }
}

/// Runs one call and answers it. Failed calls get no response.
fn spawn_tool_call(
    client: LiveClient,
    registry: Arc<ToolRegistry>,
    call: FunctionCall,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        // Marks the call finished so the main loop can forget its token.
        let _done = token.clone().drop_guard();
        println!("\n🔧 {}({})", call.name, call.args);

        match registry.execute_tool(&call, token).await {
            Ok(response) => {
                if let Err(e) = client.send_tool_response(vec![response]) {
                    log::warn!("Could not send response for {}: {}", call.id, e);
                }
            }
            Err(e) => println!("❌ {} ({}): {}", call.name, call.id, LiveError::from(e)),
        }
    });
}

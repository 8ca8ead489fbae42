use anyhow::Context;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let api_key = std::env::var("GEMINI_API_KEY").context("GEMINI_API_KEY not set")?;
    run_app(api_key).await
}

#[cfg(all(feature = "pulse", feature = "capture"))]
async fn run_app(api_key: String) -> anyhow::Result<()> {
    use memolive::analyze::GeminiVisionAnalyzer;
    use memolive::backend::frame::ScreenFrameSource;
    use memolive::backend::pulse::{PulseMicSource, PulseOutput};
    use memolive::capture::MicFactory;
    use memolive::controller::SharedSinkFactory;
    use memolive::playback::OutputSink;
    use memolive::store::JsonlMemoryStore;
    use memolive::{
        CaptureSessionController, Command, ControllerConfig, DuplexSessionClient, Notice,
        SessionConfig,
    };
    use std::sync::Arc;
    use tokio::io::AsyncBufReadExt;

    const APP_NAME: &str = "memolive";

    let cfg = ControllerConfig::new(SessionConfig::from_api_key(&api_key, ""));
    let mic_factory: MicFactory = Box::new(|| Box::new(PulseMicSource::new(APP_NAME)));
    let sink_factory: SharedSinkFactory = Arc::new(|| {
        PulseOutput::new(APP_NAME).map(|sink| Box::new(sink) as Box<dyn OutputSink>)
    });

    let (controller, mut notices) = CaptureSessionController::new(
        cfg,
        DuplexSessionClient::new(),
        ScreenFrameSource::new(),
        GeminiVisionAnalyzer::new(&api_key),
        JsonlMemoryStore::new("memories.jsonl"),
        mic_factory,
        sink_factory,
    );

    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            match notice {
                Notice::Phase(phase) => println!("[phase] {phase:?}"),
                Notice::Captured { description } => println!("[captured] {description}"),
                Notice::Transcript(text) => println!("[memory] {text}"),
                Notice::Saved { memory_text } => println!("[saved] {memory_text}"),
                Notice::Error(message) => println!("[error] {message}"),
                Notice::InputLevel(_) | Notice::OutputLevel(_) => {}
            }
        }
    });

    let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();
    let runner = tokio::spawn(controller.run(cmd_rx));

    println!("commands: start | done | cancel | quit");
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "start" => cmd_tx.send(Command::Start)?,
            "done" => cmd_tx.send(Command::Done)?,
            "cancel" => cmd_tx.send(Command::Cancel)?,
            "quit" | "exit" => break,
            "" => {}
            other => println!("unknown command: {other}"),
        }
    }

    tracing::info!("shutting down");
    drop(cmd_tx);
    runner.await?;
    Ok(())
}

#[cfg(not(all(feature = "pulse", feature = "capture")))]
async fn run_app(_api_key: String) -> anyhow::Result<()> {
    anyhow::bail!("rebuild with --features pulse,capture to run against real devices")
}

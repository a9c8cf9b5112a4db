use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chatflow::config::{EngineConfig, ModelConfig};
use chatflow::{InMemoryChatStore, OrchestratorBuilder, StreamEvent};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "chatflow",
    about = "Ask a question through the conversation engine and stream the answer"
)]
struct CliArgs {
    /// Question to ask; read from stdin when omitted
    #[arg(index = 1)]
    prompt: Option<String>,
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
    /// Model id from the config, or a provider model name without a config
    #[arg(long, short = 'm', default_value = "default")]
    model: String,
    #[arg(long)]
    system: Option<String>,
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    no_stream: bool,
    /// Print token usage when done
    #[arg(long)]
    usage: bool,
}

fn load_config(args: &CliArgs) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let mut config = EngineConfig::default();
            config.provider.api_key_env = Some("OPENAI_API_KEY".to_string());
            let model = if args.model == "default" {
                "gpt-4o-mini"
            } else {
                args.model.as_str()
            };
            config.models.push(ModelConfig::new(args.model.clone(), model));
            config
        }
    };
    if let Some(base_url) = &args.base_url {
        config.provider.base_url = base_url.clone();
    }
    if args.no_stream {
        config.provider.stream = false;
    }
    if let Some(system) = &args.system {
        for model in &mut config.models {
            model.system = Some(system.clone());
        }
    }
    config.validate()?;
    Ok(config)
}

fn read_prompt(args: &CliArgs) -> anyhow::Result<String> {
    if let Some(prompt) = &args.prompt {
        return Ok(prompt.clone());
    }
    let mut prompt = String::new();
    io::stdin().read_to_string(&mut prompt)?;
    let prompt = prompt.trim().to_string();
    if prompt.is_empty() {
        bail!("no prompt given");
    }
    Ok(prompt)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = CliArgs::parse();
    let config = load_config(&args)?;
    let prompt = read_prompt(&args)?;

    let store = Arc::new(InMemoryChatStore::new());
    let orchestrator = OrchestratorBuilder::from_config(&config, store.clone()).build();
    let (id, hash) = store.create_conversation();

    orchestrator
        .start_generation(id, prompt, &args.model, &hash)
        .await?;
    let session = orchestrator.session(id);
    let Some(mut events) = orchestrator.subscribe_channel(id).await else {
        bail!("generation ended before it could be followed");
    };

    let mut stdout = io::stdout();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(StreamEvent::MessageDelta { content, .. }) => {
                    write!(stdout, "{content}")?;
                    stdout.flush()?;
                }
                Some(StreamEvent::ToolCall { tool, rendered_args }) => {
                    log::info!("tool call {} {rendered_args}", tool.name);
                }
                Some(StreamEvent::ShowingTool { kind, .. }) => {
                    writeln!(stdout, "\n[{kind}]")?;
                }
                Some(StreamEvent::Banned) => {
                    writeln!(stdout)?;
                    eprintln!("response withheld by moderation");
                }
                Some(StreamEvent::Finished) | None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                orchestrator.cancel_generation(id);
            }
        }
    }
    writeln!(stdout)?;
    orchestrator.wait_for(id).await;

    if args.usage {
        if let Some(session) = session {
            let usage = session.usage();
            eprintln!(
                "tokens: {} prompt, {} completion, {} total",
                usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            );
        }
    }
    Ok(())
}

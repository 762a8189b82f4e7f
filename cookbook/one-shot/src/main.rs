//! Run a single turn from the command line.
//!
//! ```text
//! one-shot [--config turnloop.toml] <prompt...>
//! ```

use std::io::Write;
use std::sync::Arc;

use futures::StreamExt;
use turnloop::{
    coding_toolkit, init_tracing, AppConfig, Chunk, CompletionClient, CompletionResponse,
    ConversationMemory, DelegateTool, Message, OpenRouterChat, OpenRouterClient, OpenRouterPricing,
    PricingCache, Provider, ScriptedChat, ScriptedClient, SessionLog, StreamingEngine, ToolContext,
    ToolDispatcher, ToolExecutor, TurnEngine, TurnEvent, TurnloopError, Usage,
};

struct Args {
    config: Option<String>,
    prompt: String,
}

fn parse_args() -> turnloop::Result<Args> {
    let mut config = None;
    let mut words = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config = Some(args.next().ok_or_else(|| {
                TurnloopError::Config("--config needs a file path".into())
            })?);
        } else {
            words.push(arg);
        }
    }
    if words.is_empty() {
        return Err(TurnloopError::Config(
            "usage: one-shot [--config FILE] <prompt...>".into(),
        ));
    }
    Ok(Args {
        config,
        prompt: words.join(" "),
    })
}

#[tokio::main]
async fn main() -> turnloop::Result<()> {
    let args = parse_args()?;
    let cfg = match &args.config {
        Some(path) => AppConfig::from_env_or_file(path)?,
        None => AppConfig::from_env(),
    };
    init_tracing(&cfg.logging)?;
    cfg.validate()?;

    let mut registry = coding_toolkit(&cfg.tools);
    if !cfg.agents.is_empty() {
        registry.register(
            DelegateTool::new(cfg.agents.clone())
                .with_max_depth(cfg.engine.max_delegation_depth)
                .with_max_rounds(cfg.engine.max_rounds),
        );
    }
    let dispatcher = Arc::new(ToolDispatcher::new(registry));
    let tools = dispatcher.schemas();

    let memory = ConversationMemory::default();
    let context = ToolContext::new()
        .with_log_dir(&cfg.session.log_dir)
        .with_session_loader(Arc::new(memory.clone()));
    let log = cfg
        .session
        .enabled
        .then(|| Arc::new(SessionLog::new(&cfg.session.log_dir)));

    let pricing = match cfg.model.provider {
        Provider::OpenRouter => {
            let source = OpenRouterPricing::new(&cfg.model.base_url)?;
            let cache = PricingCache::new(Arc::new(source), &cfg.model.model);
            if let Some(price) = cache.get().await {
                eprintln!(
                    "model: {} (${:.2}/M prompt, ${:.2}/M completion)",
                    price.name,
                    price.prompt_per_million(),
                    price.completion_per_million()
                );
            }
            Some(cache)
        }
        Provider::Scripted => None,
    };

    let client: Arc<dyn CompletionClient> = match cfg.model.provider {
        Provider::OpenRouter => Arc::new(OpenRouterClient::from_config(&cfg.model)?),
        Provider::Scripted => ScriptedClient::new(vec![CompletionResponse::text(format!(
            "(scripted) {}",
            args.prompt
        ))]),
    };

    let usage = if cfg.model.stream {
        let session: Arc<dyn turnloop::ChatSession> = match cfg.model.provider {
            Provider::OpenRouter => Arc::new(OpenRouterChat::new(
                OpenRouterClient::from_config(&cfg.model)?,
                tools,
            )),
            Provider::Scripted => ScriptedChat::new(vec![vec![Chunk::text(format!(
                "(scripted) {}",
                args.prompt
            ))]]),
        };
        let engine = StreamingEngine::new(session, dispatcher)
            .with_context(context)
            .with_client(client);
        let (text, usage) = stream_to_stdout(&engine, &args.prompt).await?;
        if let Some(log) = &log {
            log.log(&[Message::user(&args.prompt), Message::assistant(text)])
                .await?;
        }
        usage
    } else {
        let mut engine = TurnEngine::new(client, dispatcher).with_context(context);
        if let Some(max_rounds) = cfg.engine.max_rounds {
            engine = engine.with_max_rounds(max_rounds);
        }
        if let Some(log) = &log {
            engine = engine.with_hook(log.clone());
        }

        memory.push(Message::user(&args.prompt)).await;
        let sent = memory.snapshot().await;
        let result = engine.run_turn(&sent, &tools).await?;
        println!("{}", result.final_text());
        if !memory.commit_turn(&sent, result.messages.clone()).await {
            eprintln!(
                "loaded a stored session with {} messages",
                memory.len().await
            );
        }
        result.usage
    };

    report_usage(usage, pricing.as_ref()).await;
    Ok(())
}

async fn stream_to_stdout(engine: &StreamingEngine, prompt: &str) -> turnloop::Result<(String, Usage)> {
    let mut events = engine.run(prompt);
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        match event {
            TurnEvent::Finished { text, usage } => {
                println!();
                return Ok((text, usage));
            }
            TurnEvent::Failed(message) => return Err(TurnloopError::Protocol(message)),
            other => {
                print!("{other}");
                stdout.flush()?;
            }
        }
    }
    Err(TurnloopError::Protocol("stream closed without a final event".into()))
}

async fn report_usage(usage: Usage, pricing: Option<&PricingCache>) {
    let cost = match pricing {
        Some(cache) => cache.cost(&usage).await,
        None => None,
    };
    match cost {
        Some(cost) => eprintln!(
            "tokens: {} prompt, {} completion (${cost:.4})",
            usage.prompt_tokens, usage.completion_tokens
        ),
        None => eprintln!(
            "tokens: {} prompt, {} completion",
            usage.prompt_tokens, usage.completion_tokens
        ),
    }
    tracing::debug!(total_tokens = usage.total_tokens(), "one-shot finished");
}

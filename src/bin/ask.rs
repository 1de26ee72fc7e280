use clap::Parser;
use futures::StreamExt;
use secrecy::SecretString;
use std::io::Write;

use ensemble_gateway::client::GatewayClient;
use ensemble_gateway::consumer::{ClientState, ModelStatus, SynthesisStatus};
use ensemble_gateway::events::StreamEvent;
use ensemble_gateway::models::GenerationRequest;

// Ask a running gateway a question and print the synthesized answer
#[derive(Parser)]
#[command(name = "ensemble-ask")]
#[command(about = "Send a prompt through the ensemble gateway")]
struct Args {
    prompt: String,

    // Model to query, repeat for more (duplicates run side by side)
    #[arg(short, long = "model", required = true)]
    models: Vec<String>,

    #[arg(long, env = "GATEWAY_URL", default_value = "http://localhost:8080")]
    gateway: String,

    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long)]
    refinement_model: Option<String>,

    #[arg(long)]
    session_id: Option<String>,

    // Also print each model's draft once it completes
    #[arg(long, default_value_t = false)]
    show_models: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let mut client = GatewayClient::new(&args.gateway);
    if let Some(key) = args.api_key {
        client = client.with_api_key(SecretString::new(key));
    }

    let request = GenerationRequest {
        prompt: args.prompt,
        models: args.models,
        refinement_model: args.refinement_model,
        session_id: args.session_id,
        ..Default::default()
    };

    let mut events = client.generate(&request).await?;
    let mut state = ClientState::new();
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        let event = event?;
        match &event {
            StreamEvent::ModelStart { instance_id, .. } => eprintln!("[{instance_id}] started"),
            StreamEvent::ModelComplete {
                instance_id,
                content,
                word_count,
                ..
            } => {
                eprintln!("[{instance_id}] done, {word_count} words");
                if args.show_models {
                    eprintln!("{content}\n");
                }
            }
            StreamEvent::ModelError { instance_id, error, .. } => {
                eprintln!("[{instance_id}] failed: {error}")
            }
            StreamEvent::SynthesisStart { model_id } => eprintln!("synthesizing with {model_id}"),
            StreamEvent::SynthesisChunk { content } => {
                write!(stdout, "{content}")?;
                stdout.flush()?;
            }
            StreamEvent::Warning { warning } => eprintln!("warning: {warning}"),
            StreamEvent::Error { error } => eprintln!("error: {error}"),
            _ => {}
        }
        state.apply(event);
    }
    if state.synthesis.status == SynthesisStatus::Complete {
        writeln!(stdout)?;
    } else if let Some(answer) = state.final_answer() {
        writeln!(stdout, "{answer}")?;
    }

    let unfinished = state
        .models
        .iter()
        .filter(|m| m.status == ModelStatus::Streaming)
        .count();
    if unfinished > 0 {
        eprintln!("{unfinished} model(s) never finished");
    }

    if state.final_answer().is_none() {
        std::process::exit(1);
    }
    Ok(())
}

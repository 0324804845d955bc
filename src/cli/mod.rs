// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Parses the command line with clap and hands off to Layer 2.
//
//   1. `train`    — fine-tunes an adapter and saves checkpoints
//   2. `generate` — reloads a saved adapter and answers a prompt
//
// Ctrl-C during `train` requests cancellation; the job stops at
// the next batch boundary and still writes its final checkpoint.

pub mod commands;

use anyhow::{Context, Result};
use burn::backend::{wgpu::WgpuDevice, Autodiff, Wgpu};
use clap::Parser;
use commands::{Commands, GenerateArgs, TrainArgs};

use crate::domain::traits::TextGenerator;
use crate::ml::trainer::CancellationToken;

type TrainBackend = Autodiff<Wgpu>;
type InferBackend = Wgpu;

#[derive(Parser, Debug)]
#[command(
    name = "adapter-tune",
    version,
    about = "Fine-tune a low-rank adapter on instruction/response pairs, then generate with it."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args)    => run_train(args),
            Commands::Generate(args) => run_generate(args),
        }
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    tracing::info!("Fine-tuning '{}' on '{}'", args.base_model, args.data.display());

    let token = CancellationToken::new();
    let handler_token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::warn!("Interrupt received, stopping after the current batch");
        handler_token.cancel();
    }) {
        tracing::warn!("Ctrl-C handler not installed: {}", e);
    }

    let device = WgpuDevice::default();
    tracing::info!("Using WGPU device: {:?}", device);

    let report = TrainUseCase::new(args.into())
        .with_cancellation(token)
        .execute::<TrainBackend>(device)
        .context("training did not complete")?;

    println!(
        "Training {:?} after {} steps (avg loss {:.4}). Adapter saved to '{}'.",
        report.state,
        report.steps,
        report.average_loss,
        report.final_checkpoint.path.display()
    );
    Ok(())
}

fn run_generate(args: GenerateArgs) -> Result<()> {
    use crate::application::generate_use_case::GenerateUseCase;

    let device = WgpuDevice::default();
    let use_case = GenerateUseCase::<InferBackend>::new(&args.adapter_dir, args.max_new_tokens, device)
        .with_context(|| format!("cannot load adapter from '{}'", args.adapter_dir.display()))?;

    let response = use_case.generate(&args.prompt)?;
    println!("{response}");
    Ok(())
}

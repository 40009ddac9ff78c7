use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use layerfit::arrange::{Offset, place_arranged, placement_offset, selection_bounds};
use layerfit::config::EngineConfig;
use layerfit::handle::{Handle, resize_rect};
use layerfit::layer::{Layer, LayerIndex, LayerSpec};
use layerfit::proposal::{
    IdentityProposal, ProposalError, ProposalProvider, ProposalSet, ScaleProposal, dispatch,
};
use layerfit::rect::{PartialRect, Rect, Size};
use layerfit::session::{Adjustment, ApplyOutcome, SessionStats};
use layerfit::{EngineError, PreviewSession};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Proposal(#[from] ProposalError),
    #[error("proposal task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("proposal channel closed before a reply arrived")]
    ChannelClosed,
}

#[derive(Parser, Debug)]
#[command(name = "layerfit", about = "Headless layer resize preview and arrangement placement")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a preview session from a plan, apply its edits, print the commit payload.
    Preview {
        plan: PathBuf,
        /// Overrides the plan's proposal strategy.
        #[arg(long, value_enum)]
        strategy: Option<Strategy>,
    },
    /// Place an arranged group beside its originals.
    Arrange {
        file: PathBuf,
        /// Gap in scene units; defaults to the file, then LAYERFIT_ARRANGE_SPACING.
        #[arg(long)]
        spacing: Option<f64>,
    },
}

/// Built-in proposal source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
enum Strategy {
    Identity,
    #[default]
    Uniform,
    Stretch,
}

impl ProposalProvider for Strategy {
    fn propose(&self, original_canvas: Size, target: Size, layers: &[LayerSpec]) -> ProposalSet {
        match self {
            Self::Identity => IdentityProposal.propose(original_canvas, target, layers),
            Self::Uniform => ScaleProposal::uniform().propose(original_canvas, target, layers),
            Self::Stretch => ScaleProposal::stretch().propose(original_canvas, target, layers),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PreviewPlan {
    original_canvas: Size,
    target: Size,
    #[serde(default)]
    strategy: Strategy,
    layers: Vec<LayerSpec>,
    /// Second target, proposed asynchronously before the edits run.
    #[serde(default)]
    retarget: Option<Size>,
    #[serde(default)]
    edits: Vec<PlanEdit>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PlanEdit {
    Adjust {
        index: LayerIndex,
        adjustment: Adjustment,
    },
    Drag {
        index: LayerIndex,
        handle: Handle,
        dx: f64,
        dy: f64,
        #[serde(default)]
        aspect_locked: bool,
    },
    ToggleVisibility {
        index: LayerIndex,
    },
    Reset {
        index: LayerIndex,
    },
    ResetAll,
    Reorder {
        index: LayerIndex,
        to_position: usize,
    },
    ResetOrder,
}

#[derive(Debug, Serialize)]
struct PreviewReport {
    session_id: String,
    target: Size,
    stats: SessionStats,
    layers: Vec<Layer>,
}

#[derive(Debug, Deserialize)]
struct ArrangeInput {
    originals: Vec<Rect>,
    arranged: Vec<Rect>,
    #[serde(default)]
    spacing: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ArrangeReport {
    offset: Offset,
    placed: Vec<Rect>,
    bounds: Option<Rect>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    init_tracing();
    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;

    let output = match cli.command {
        Command::Preview { plan, strategy } => {
            let mut plan: PreviewPlan = read_json(&plan)?;
            if let Some(strategy) = strategy {
                plan.strategy = strategy;
            }
            serde_json::to_value(run_preview(plan, config).await?)?
        }
        Command::Arrange { file, spacing } => {
            let input: ArrangeInput = read_json(&file)?;
            let spacing = spacing.or(input.spacing).unwrap_or(config.arrange_spacing);
            serde_json::to_value(run_arrange(&input, spacing)?)?
        }
    };
    print_json(&output)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

async fn run_preview(plan: PreviewPlan, config: EngineConfig) -> Result<PreviewReport, CliError> {
    let strategy = plan.strategy;
    let mut session = PreviewSession::new(plan.layers, plan.original_canvas, plan.target, &strategy, config)?;

    if let Some(target) = plan.retarget {
        let request = session.request_retarget(target)?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatch(Arc::new(strategy), request, tx).await?;
        let reply = rx.recv().await.ok_or(CliError::ChannelClosed)?;
        match session.apply_proposal(reply) {
            ApplyOutcome::Applied => info!(?strategy, "retarget applied"),
            ApplyOutcome::Stale => warn!("retarget reply was stale"),
            ApplyOutcome::Failed(e) => return Err(e.into()),
        }
    }

    for edit in plan.edits {
        apply_edit(&mut session, edit)?;
    }

    Ok(PreviewReport {
        session_id: session.id().to_string(),
        target: session.target(),
        stats: session.stats(),
        layers: session.to_commit_payload(),
    })
}

fn apply_edit(session: &mut PreviewSession, edit: PlanEdit) -> Result<(), EngineError> {
    match edit {
        PlanEdit::Adjust { index, adjustment } => {
            session.adjust(index, adjustment)?;
        }
        PlanEdit::Drag { index, handle, dx, dy, aspect_locked } => {
            let anchor = session.layer(index)?.preview();
            let rect = resize_rect(anchor, handle, dx, dy, aspect_locked, session.target());
            if rect == anchor {
                debug!(index, ?handle, "drag left the layer unchanged");
            } else {
                session.set_preview_rect(index, &PartialRect::full(rect))?;
            }
        }
        PlanEdit::ToggleVisibility { index } => {
            session.toggle_visibility(index)?;
        }
        PlanEdit::Reset { index } => {
            session.reset_layer(index)?;
        }
        PlanEdit::ResetAll => session.reset_all(),
        PlanEdit::Reorder { index, to_position } => session.reorder(index, to_position)?,
        PlanEdit::ResetOrder => session.reset_order(),
    }
    Ok(())
}

fn run_arrange(input: &ArrangeInput, spacing: f64) -> Result<ArrangeReport, EngineError> {
    let offset = placement_offset(&input.originals, &input.arranged, spacing)?;
    let placed = place_arranged(&input.originals, &input.arranged, spacing)?;
    let bounds = selection_bounds(&placed);
    Ok(ArrangeReport { offset, placed, bounds })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    let file = File::open(path).map_err(|source| CliError::Read { path: path.display().to_string(), source })?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;

//! Operator command line for validating placement rule files offline.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::PlacementConfig;
use crate::engine::PlacementEngine;
use crate::kvstore::MemoryKvStore;
use crate::placement::{Coverage, GroupBundle};
use crate::region::{MemoryRegionDirectory, MemoryStoreLabels, Region, StoreLabel};
use crate::types::StoreId;

/// Command-line arguments.
#[derive(Parser)]
#[command(name = "ksp-placement")]
#[command(about = "Keyspan placement rule tool", long_about = None)]
pub struct Cli {
    /// Engine configuration file (`.toml` or `.json`).
    #[arg(short, long, env = "KSP_PLACEMENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Print the rule bundles of a freshly bootstrapped engine.
    Bundles,
    /// Apply a JSON list of bundles and print the resulting bundles.
    Apply {
        /// Bundle list file.
        file: PathBuf,
        /// Replace every group instead of only the listed ones.
        #[arg(long)]
        full_replace: bool,
        /// Accept rule sets that leave part of the key space uncovered.
        #[arg(long)]
        allow_gaps: bool,
    },
    /// Evaluate a region against a rule set and print the fit.
    Fit {
        /// Fit description file.
        file: PathBuf,
    },
}

/// A store and its labels, as listed in a fit description.
#[derive(Debug, Deserialize)]
pub struct StoreInput {
    /// Store id.
    pub id: u64,
    /// Store labels.
    #[serde(default)]
    pub labels: Vec<StoreLabel>,
}

/// Input of the `fit` subcommand.
#[derive(Debug, Deserialize)]
pub struct FitInput {
    /// Bundles applied on top of the defaults before fitting.
    #[serde(default)]
    pub bundles: Vec<GroupBundle>,
    /// Store labels.
    #[serde(default)]
    pub stores: Vec<StoreInput>,
    /// Region to evaluate.
    pub region: Region,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

impl Cli {
    /// Runs the command and returns its JSON output.
    pub fn run(&self) -> Result<String> {
        let config = match &self.config {
            Some(path) => PlacementConfig::from_file(path)?,
            None => PlacementConfig::default(),
        };
        let engine = PlacementEngine::bootstrap(
            config,
            Arc::new(MemoryKvStore::new()),
            Arc::new(MemoryRegionDirectory::new()),
        )?;

        let output = match &self.command {
            Command::Bundles => serde_json::to_string_pretty(&engine.rules().get_all_bundles())?,
            Command::Apply {
                file,
                full_replace,
                allow_gaps,
            } => {
                let bundles: Vec<GroupBundle> = read_json(file)?;
                let coverage = if *allow_gaps {
                    Coverage::AllowGaps
                } else {
                    Coverage::Enforce
                };
                engine
                    .controller()
                    .set_bundles(bundles, *full_replace, coverage)?;
                serde_json::to_string_pretty(&engine.rules().get_all_bundles())?
            }
            Command::Fit { file } => {
                let input: FitInput = read_json(file)?;
                if !input.bundles.is_empty() {
                    engine
                        .controller()
                        .set_bundles(input.bundles, false, Coverage::Enforce)?;
                }
                let stores = MemoryStoreLabels::new();
                for store in input.stores {
                    stores.put_store(StoreId::new(store.id), store.labels);
                }
                let fit = engine.rules().fit_region(&input.region, &stores);
                serde_json::to_string_pretty(&fit)?
            }
        };
        engine.shutdown();
        Ok(output)
    }
}

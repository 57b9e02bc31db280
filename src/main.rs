use std::fs::{create_dir_all, write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use nmlio::{
    export::export_model,
    import::import_files,
    part::Part,
    schema::Schema,
    Map,
};

#[derive(Parser)]
#[clap(name = "nmlio", about = "Translate between part models and NeuroML/LEMS documents")]
struct Cli {
    /// Verbosity; repeat for more detail
    #[clap(short, long, parse(from_occurrences))]
    verbose: usize,
    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Import interchange documents into a part model
    Import {
        /// Input documents; includes are followed
        files: Vec<String>,
        /// Output directory
        #[clap(short, long, default_value = ".")]
        output: String,
    },
    /// Export a part model back into interchange documents
    Export {
        /// Part model as written by import (JSON)
        model: String,
        /// Root part to export; defaults to the first network
        #[clap(short, long)]
        root: Option<String>,
        /// Output directory
        #[clap(short, long, default_value = ".")]
        output: String,
    },
    /// Digest a schema file and summarise its tables
    Schema {
        /// XSD-like schema document
        file: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.cmd {
        Cmd::Import { files, output } => {
            if files.is_empty() {
                anyhow::bail!("No input documents given");
            }
            let result = import_files(&files).context("Import failed")?;
            create_dir_all(&output)?;
            let mut path = PathBuf::from(&output);
            path.push("model.json");
            let json = serde_json::to_string_pretty(&result.parts)?;
            write(&path, json).with_context(|| format!("Writing {:?}", path))?;
            info!("Wrote {} parts to {:?}", result.parts.len(), path);
            print!("{}", result.report);
            Ok(())
        }
        Cmd::Export {
            model,
            root,
            output,
        } => {
            let json = std::fs::read_to_string(&model)
                .with_context(|| format!("Reading {}", model))?;
            let parts: Map<String, Part> =
                serde_json::from_str(&json).context("Decoding part model")?;
            let root = match root {
                Some(r) => r,
                None => parts
                    .values()
                    .find(|p| p.xml_role() == Some("network"))
                    .or_else(|| parts.values().next())
                    .map(|p| p.id.to_string())
                    .context("Model is empty")?,
            };
            let part = parts
                .get(&root)
                .with_context(|| format!("No part {} in model", root))?;
            let result = export_model(part, &parts).context("Export failed")?;
            create_dir_all(&output)?;
            for file in &result.files {
                let mut path = PathBuf::from(&output);
                path.push(&file.name);
                write(&path, &file.content).with_context(|| format!("Writing {:?}", path))?;
                info!("Wrote {:?}", path);
            }
            if !result.manifest.is_empty() {
                let mut path = PathBuf::from(&output);
                path.push(format!("{}.manifest", root));
                write(&path, &result.manifest)?;
            }
            print!("{}", result.report);
            Ok(())
        }
        Cmd::Schema { file } => {
            let schema = Schema::from_file(&file).context("Digesting schema")?;
            let summary: Map<&String, usize> = schema
                .types
                .iter()
                .map(|(n, t)| (n, t.sequence.len()))
                .collect();
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

//! `curator dataset …` commands: curation platform administration.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::Config;
use crate::curation::{CurationClient, DatasetConfig, DatasetSpec, Label, LabelLevel};
use crate::schema_sheet;

pub async fn run_dataset_create(config: &Config, spec: DatasetSpec) -> Result<()> {
    let client = CurationClient::from_config(config)?;
    let response = client
        .create_dataset(&DatasetConfig::for_create(spec))
        .await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

pub async fn run_dataset_update(config: &Config, dataset_id: i64, spec: DatasetSpec) -> Result<()> {
    let client = CurationClient::from_config(config)?;
    let response = client.update_dataset(dataset_id, spec).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// Labels from the internal/mapping column pair of one sheet.
pub fn labels_from_sheet(
    workbook: &Path,
    sheet_name: &str,
    internal_column: &str,
    mapping_column: &str,
) -> Result<Vec<Label>> {
    let sheet = schema_sheet::read_sheet_file(workbook, sheet_name)
        .with_context(|| format!("cannot read labels from {}", workbook.display()))?;
    Ok(sheet
        .column_pairs(internal_column, mapping_column)?
        .into_iter()
        .map(|(name, title)| Label { title, name })
        .collect())
}

pub struct LabelArgs<'a> {
    pub dataset_id: i64,
    pub level: &'a str,
    pub workbook: &'a Path,
    pub sheet: &'a str,
    pub internal_column: &'a str,
    pub mapping_column: &'a str,
}

pub async fn run_dataset_labels(config: &Config, args: LabelArgs<'_>) -> Result<()> {
    let level: LabelLevel = args.level.parse()?;
    let labels = labels_from_sheet(
        args.workbook,
        args.sheet,
        args.internal_column,
        args.mapping_column,
    )?;

    let client = CurationClient::from_config(config)?;
    let report = client
        .add_labels(
            args.dataset_id,
            level,
            labels,
            config.curation.label_batch_size,
        )
        .await?;

    println!(
        "Added {} {} labels to dataset {} in {} request(s).",
        report.labels,
        level.as_str(),
        args.dataset_id,
        report.batches
    );
    if let Some(last) = report.last_response {
        println!("{}", serde_json::to_string_pretty(&last)?);
    }
    Ok(())
}

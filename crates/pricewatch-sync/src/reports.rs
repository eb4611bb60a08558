//! Per-cycle report artifacts: markdown brief, drops JSON, parquet snapshots and
//! a sha256 manifest over them.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use pricewatch_core::{format_minor_units, PriceTrace};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::detect::ProductDrop;
use crate::CycleSummary;

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub(crate) async fn write_reports(
    reports_dir: &Path,
    summary: &CycleSummary,
    drops: &[ProductDrop],
) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join("cycle_brief.md"), cycle_brief(summary, drops))
        .await
        .context("writing cycle_brief.md")?;

    let drops_json = serde_json::to_vec_pretty(&serde_json::json!({
        "cycle": summary,
        "drops": drops,
    }))
    .context("serializing drops")?;
    fs::write(reports_dir.join("drops.json"), drops_json)
        .await
        .context("writing drops.json")?;
    Ok(())
}

fn cycle_brief(summary: &CycleSummary, drops: &[ProductDrop]) -> String {
    let drop_lines = if drops.is_empty() {
        "- none".to_string()
    } else {
        drops
            .iter()
            .flat_map(|drop| {
                drop.triggering.iter().map(move |color| {
                    format!(
                        "- {} / {}: {} -> {} (-{:.1}%)",
                        drop.product.name,
                        color.color.name,
                        format_minor_units(color.previous),
                        format_minor_units(color.current),
                        color.drop_percent
                    )
                })
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "# Pricewatch Cycle Brief\n\n- Run ID: `{}`\n- Day: {}\n- Started: {}\n- Finished: {}\n- Snapshots: {}\n- Products created: {}\n- Price traces: {}\n- Availability traces: {}\n- Skipped items: {}\n- Failed products: {}\n- Notifications: {} sent, {} failed\n\n## Drops\n{}\n",
        summary.run_id,
        summary.as_of,
        summary.started_at,
        summary.finished_at,
        summary.snapshots,
        summary.ingest.products_created,
        summary.ingest.price_traces,
        summary.ingest.availability_traces,
        summary.ingest.skipped,
        summary.failed_products,
        summary.notifications_sent,
        summary.notifications_failed,
        drop_lines
    )
}

/// Writes the day's traces and the flagged drops as parquet, then the manifest.
pub(crate) async fn export_parquet_snapshots(
    reports_dir: &Path,
    traces: &[PriceTrace],
    drops: &[ProductDrop],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let traces_path = snapshot_dir.join("price_traces.parquet");
    let drops_path = snapshot_dir.join("drops.parquet");
    write_price_traces_parquet(&traces_path, traces)?;
    write_drops_parquet(&drops_path, drops)?;

    let manifest = ReportManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("price_traces", reports_dir, &traces_path)?,
            manifest_entry("drops", reports_dir, &drops_path)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_price_traces_parquet(path: &Path, traces: &[PriceTrace]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("trace_id", DataType::Int64, false),
        ArrowField::new("owner_kind", DataType::Utf8, false),
        ArrowField::new("owner_id", DataType::Int64, false),
        ArrowField::new("price", DataType::Int64, false),
        ArrowField::new("old_price", DataType::Int64, true),
        ArrowField::new("original_price", DataType::Int64, true),
        ArrowField::new("created_at", DataType::Utf8, false),
    ]));

    let ids = Int64Array::from(traces.iter().map(|t| t.id).collect::<Vec<_>>());
    let kinds = StringArray::from(traces.iter().map(|t| t.owner.kind()).collect::<Vec<_>>());
    let owners = Int64Array::from(traces.iter().map(|t| t.owner.row_id()).collect::<Vec<_>>());
    let prices = Int64Array::from(traces.iter().map(|t| t.price).collect::<Vec<_>>());
    let old_prices = Int64Array::from(traces.iter().map(|t| t.old_price).collect::<Vec<_>>());
    let original_prices = Int64Array::from(traces.iter().map(|t| t.original_price).collect::<Vec<_>>());
    let created = StringArray::from(
        traces
            .iter()
            .map(|t| t.created_at.to_rfc3339())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(kinds),
            Arc::new(owners),
            Arc::new(prices),
            Arc::new(old_prices),
            Arc::new(original_prices),
            Arc::new(created),
        ],
    )
    .context("building price traces record batch")?;
    write_parquet(path, batch)
}

fn write_drops_parquet(path: &Path, drops: &[ProductDrop]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("product_external_id", DataType::Utf8, false),
        ArrowField::new("market", DataType::Utf8, false),
        ArrowField::new("color_external_id", DataType::Utf8, false),
        ArrowField::new("previous", DataType::Int64, false),
        ArrowField::new("current", DataType::Int64, false),
        ArrowField::new("drop_percent", DataType::Float64, false),
    ]));

    let rows = drops
        .iter()
        .flat_map(|drop| drop.triggering.iter().map(move |color| (&drop.product, color)))
        .collect::<Vec<_>>();

    let products = StringArray::from(rows.iter().map(|(p, _)| p.external_id.as_str()).collect::<Vec<_>>());
    let markets = StringArray::from(rows.iter().map(|(p, _)| p.market.as_str()).collect::<Vec<_>>());
    let colors = StringArray::from(rows.iter().map(|(_, c)| c.color.external_id.as_str()).collect::<Vec<_>>());
    let previous = Int64Array::from(rows.iter().map(|(_, c)| c.previous).collect::<Vec<_>>());
    let current = Int64Array::from(rows.iter().map(|(_, c)| c.current).collect::<Vec<_>>());
    let percents = Float64Array::from(rows.iter().map(|(_, c)| c.drop_percent).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(products),
            Arc::new(markets),
            Arc::new(colors),
            Arc::new(previous),
            Arc::new(current),
            Arc::new(percents),
        ],
    )
    .context("building drops record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path.strip_prefix(reports_dir).unwrap_or(path).display().to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pricewatch_core::{ColorId, TraceOwner};
    use tempfile::tempdir;

    #[tokio::test]
    async fn parquet_export_writes_manifest_with_hashes() {
        let dir = tempdir().expect("tempdir");
        let traces = vec![PriceTrace {
            id: 1,
            owner: TraceOwner::Color(ColorId(4)),
            price: 1999,
            old_price: Some(2599),
            original_price: None,
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap(),
        }];

        let manifest_path = export_parquet_snapshots(dir.path(), &traces, &[]).await.unwrap();
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        let files = manifest["files"].as_array().unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(files[0]["path"], "snapshots/price_traces.parquet");
        assert_eq!(files[0]["sha256"].as_str().unwrap().len(), 64);
        assert!(files[1]["bytes"].as_u64().unwrap() > 0);
    }
}

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use serde::Serialize;
use strata_core::{BundleError, StorageKind};
use strata_engine::authoring::{scan_dir, PlanSummary, ScannedFile};
use strata_engine::fsutil::blocking;
use strata_engine::{BundlePlan, PublishOptions, Publisher};
use strata_storage::{BundleRegistry, InMemoryRegistry, ObjectStoreExternal};

use super::super::args::{PlanArgs, PushArgs, ScanArgs};
use super::super::output::{emit, human_bytes};
use crate::config::Settings;
use crate::exit_codes::EXIT_SUCCESS;

pub async fn cmd_scan(args: ScanArgs) -> anyhow::Result<i32> {
    let dir = args.dir.clone();
    let files: Vec<ScannedFile> = blocking(move || scan_dir(&dir)).await?;

    emit(args.output.json, &files, |out| {
        for file in &files {
            writeln!(out, "{:>10}  {:o}  {}", human_bytes(file.size), file.mode, file.path)?;
        }
        let total: u64 = files.iter().map(|f| f.size).sum();
        writeln!(out, "{} files, {}", files.len(), human_bytes(total))
    })?;
    Ok(EXIT_SUCCESS)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlanOutput<'a> {
    #[serde(flatten)]
    plan: &'a BundlePlan,
    summary: PlanSummary,
}

pub async fn cmd_plan(args: PlanArgs) -> anyhow::Result<i32> {
    let dir = args.dir.clone();
    let plan = blocking(move || BundlePlan::build(&dir)).await?;
    let output = PlanOutput {
        plan: &plan,
        summary: plan.summary(),
    };

    emit(args.output.json, &output, |out| {
        let meta = &plan.spec.metadata;
        writeln!(out, "{}:{}  {}", meta.name, meta.version, plan.manifest_digest)?;
        for layer in &plan.layers {
            writeln!(out, "layer {} ({} files)", layer.name, layer.files.len())?;
            for file in &layer.files {
                let entry = &file.entry;
                match entry.kind {
                    StorageKind::Inline => {
                        writeln!(out, "  inline    {:>10}  {}", human_bytes(entry.size), entry.path)?
                    }
                    StorageKind::External => writeln!(
                        out,
                        "  external  {:>10}  {} -> {}",
                        human_bytes(entry.size),
                        entry.path,
                        entry.uri.as_deref().unwrap_or("?")
                    )?,
                }
            }
        }
        let summary = &output.summary;
        writeln!(
            out,
            "inline: {} files, {}; external: {} files, {}",
            summary.inline_files,
            human_bytes(summary.inline_bytes),
            summary.external_files,
            human_bytes(summary.external_bytes)
        )
    })?;
    Ok(EXIT_SUCCESS)
}

pub async fn cmd_push(args: PushArgs, settings: &Settings) -> anyhow::Result<i32> {
    let annotations = parse_annotations(&args.annotations)?;
    let dir = args.dir.clone();
    let plan = blocking(move || BundlePlan::build(&dir)).await?;

    // A dry run never touches a store, so it works without a registry.
    let registry: Arc<dyn BundleRegistry> = match settings.registry_client()? {
        Some(registry) => registry,
        None if args.dry_run => Arc::new(InMemoryRegistry::new(plan.spec.metadata.name.clone())),
        None => {
            return Err(BundleError::validation(
                "no registry configured; set STRATA_REGISTRY_URL and STRATA_REGISTRY_REPO",
            )
            .into())
        }
    };
    let publisher = Publisher::new(registry, Arc::new(ObjectStoreExternal::new()));
    let options = PublishOptions {
        dry_run: args.dry_run,
        annotations,
    };
    let report = publisher.publish(&plan, &options).await?;

    emit(args.output.json, &report, |out| {
        let verb = if report.dry_run { "would publish" } else { "published" };
        writeln!(out, "{} {}", verb, report.manifest_digest)?;
        for tag in &report.tags {
            writeln!(out, "  tag {}", tag)?;
        }
        if let Some(digest) = &report.registry_digest {
            writeln!(out, "  envelope {}", digest)?;
        }
        writeln!(
            out,
            "blobs: {} uploaded, {} present; external: {} uploaded, {} present",
            report.blobs_uploaded,
            report.blobs_skipped,
            report.external_uploaded,
            report.external_skipped
        )
    })?;
    Ok(EXIT_SUCCESS)
}

fn parse_annotations(raw: &[String]) -> Result<BTreeMap<String, String>, BundleError> {
    raw.iter()
        .map(|item| match item.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.to_string()))
            }
            _ => Err(BundleError::validation(format!(
                "annotation '{}' is not KEY=VALUE",
                item
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_annotations() {
        let parsed = parse_annotations(&[
            "org.example.team=ml".to_string(),
            "note=a=b".to_string(),
        ])
        .unwrap();
        assert_eq!(parsed["org.example.team"], "ml");
        assert_eq!(parsed["note"], "a=b");

        assert!(parse_annotations(&["=x".to_string()]).is_err());
        assert!(parse_annotations(&["novalue".to_string()]).is_err());
    }
}

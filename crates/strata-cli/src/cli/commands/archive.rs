use std::io::Write;

use strata_engine::fsutil::blocking;
use strata_engine::{export_dir, import_archive, ExportOptions, ImportOptions};

use super::super::args::{ExportArgs, ImportArgs};
use super::super::output::{emit, human_bytes};
use crate::exit_codes::EXIT_SUCCESS;

pub async fn cmd_export(args: ExportArgs) -> anyhow::Result<i32> {
    let options = ExportOptions {
        compression: args.compression,
        level: args.level,
        include_external: args.include_external,
    };
    let (src, out) = (args.src.clone(), args.out.clone());
    let report = blocking(move || export_dir(&src, &out, &options)).await?;

    emit(args.output.json, &report, |out| {
        writeln!(
            out,
            "{} ({}, {}): {} files, {} directories",
            report.output.display(),
            report.compression,
            human_bytes(report.size),
            report.files,
            report.directories
        )?;
        writeln!(out, "digest: {}", report.digest)?;
        if report.excluded > 0 {
            writeln!(
                out,
                "{} pointer-backed data files left out (use --include-external to keep them)",
                report.excluded
            )?;
        }
        Ok(())
    })?;
    Ok(EXIT_SUCCESS)
}

pub async fn cmd_import(args: ImportArgs) -> anyhow::Result<i32> {
    let (archive, dest) = (args.archive.clone(), args.dest.clone());
    let report =
        blocking(move || import_archive(&archive, &dest, &ImportOptions::default())).await?;

    emit(args.output.json, &report, |out| {
        writeln!(
            out,
            "{} -> {}: {} files, {} verified",
            args.archive.display(),
            report.dest.display(),
            report.files,
            report.verified
        )?;
        for warning in &report.warnings {
            writeln!(out, "warning: {}", warning)?;
        }
        Ok(())
    })?;
    Ok(EXIT_SUCCESS)
}

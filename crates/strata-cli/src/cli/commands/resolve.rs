use std::collections::BTreeMap;
use std::io::Write;

use serde::Serialize;
use strata_core::{select_role, BundleMetadata, Digest, ResolvedBundle};
use strata_engine::ResolverConfig;

use super::super::args::ResolveArgs;
use super::super::output::emit;
use super::{build_resolver, parse_reference};
use crate::config::Settings;
use crate::exit_codes::EXIT_SUCCESS;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResolveOutput<'a> {
    source: String,
    #[serde(flatten)]
    bundle: &'a ResolvedBundle,
    metadata: &'a BundleMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    selected_role: Option<RoleOutput>,
}

#[derive(Serialize)]
struct RoleOutput {
    name: String,
    layers: Vec<String>,
}

pub async fn run(args: ResolveArgs, settings: &Settings) -> anyhow::Result<i32> {
    let reference = parse_reference(&args.reference)?;
    let (cache, config) = if args.prime_cache {
        (Some(settings.cache()?), ResolverConfig::default().prime_cache())
    } else {
        (None, ResolverConfig::default())
    };
    let resolver = build_resolver(settings, cache, config)?;
    let resolution = resolver.resolve(&reference).await?;

    let selected_role = if args.role.is_some() || resolution.role_hint.is_some() {
        let role = select_role(
            &resolution.bundle,
            args.role.as_deref(),
            resolution.role_hint.as_deref(),
        )?;
        Some(RoleOutput {
            name: role.name,
            layers: role.layers,
        })
    } else {
        None
    };

    let output = ResolveOutput {
        source: resolution.source.to_string(),
        bundle: &resolution.bundle,
        metadata: &resolution.metadata,
        selected_role,
    };
    emit(args.output.json, &output, |out| {
        let bundle = output.bundle;
        writeln!(out, "digest:  {}", bundle.manifest_digest)?;
        writeln!(out, "source:  {}", output.source)?;
        if let (Some(name), Some(version)) = (&output.metadata.name, &output.metadata.version) {
            writeln!(out, "bundle:  {}:{}", name, version)?;
        }
        if let Some(digest) = &output.metadata.registry_digest {
            writeln!(out, "envelope: {}", digest)?;
        }
        writeln!(out, "layers:")?;
        for layer in &bundle.layers {
            writeln!(out, "  {:<16} {}", layer.name, short(&layer.layer_id))?;
        }
        writeln!(out, "roles:")?;
        write_roles(out, &bundle.roles)?;
        if let Some(role) = &output.selected_role {
            writeln!(out, "selected role: {} [{}]", role.name, role.layers.join(", "))?;
        }
        if let Some(dir) = &bundle.cache_dir {
            writeln!(out, "cache:   {}", dir.display())?;
        }
        Ok(())
    })?;
    Ok(EXIT_SUCCESS)
}

fn write_roles(
    out: &mut dyn Write,
    roles: &BTreeMap<String, Vec<String>>,
) -> std::io::Result<()> {
    for (name, layers) in roles {
        writeln!(out, "  {:<16} {}", name, layers.join(", "))?;
    }
    Ok(())
}

/// First 12 hex characters, as registries print image ids.
fn short(digest: &Digest) -> &str {
    let hex = digest.hex();
    &hex[..hex.len().min(12)]
}

use std::io::Write;
use std::sync::Arc;

use strata_engine::{MaterializeOptions, Materializer, Outcome, ResolverConfig};
use strata_storage::ObjectStoreExternal;
use tracing::debug;

use super::super::args::MaterializeArgs;
use super::super::output::emit;
use super::{build_resolver, parse_reference};
use crate::config::Settings;
use crate::exit_codes::EXIT_SUCCESS;

pub async fn run(args: MaterializeArgs, settings: &Settings) -> anyhow::Result<i32> {
    let reference = parse_reference(&args.reference)?;
    let cache = if args.no_cache {
        None
    } else {
        Some(settings.cache()?)
    };
    let resolver = build_resolver(settings, cache.clone(), ResolverConfig::default())?;
    let resolution = resolver.resolve(&reference).await?;

    let provider = resolver.provider_for(&resolution, Arc::new(ObjectStoreExternal::new()))?;
    let mut materializer = Materializer::new(provider);
    if let Some(cache) = cache {
        debug!(cache = %cache.root().display(), "materializing through cache");
        materializer = materializer.with_cache(cache);
    }

    let options = MaterializeOptions {
        role: args.role,
        overwrite: args.overwrite,
        prefetch_external: args.prefetch_external,
        timestamp: settings.source_date,
    };
    let report = materializer
        .materialize(&resolution, &args.dest, &options)
        .await?;

    emit(args.output.json, &report, |out| {
        writeln!(
            out,
            "{} role '{}' [{}] -> {}",
            report.manifest_digest,
            report.role,
            report.layers.join(", "),
            report.dest.display()
        )?;
        for path in &report.outcomes {
            if path.outcome != Outcome::Unchanged {
                writeln!(out, "  {:<9} {}", path.outcome, path.path)?;
            }
        }
        let counts = &report.counts;
        writeln!(
            out,
            "created {}, replaced {}, unchanged {}; {} pointers, {} prefetched",
            counts.created, counts.replaced, counts.unchanged, report.pointers, report.prefetched
        )
    })?;
    Ok(EXIT_SUCCESS)
}

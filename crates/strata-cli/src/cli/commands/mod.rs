use std::path::Path;

use strata_core::{BundleRef, BundleResult};
use strata_engine::{BundleResolver, ContentCache, ResolverConfig};

use super::args::*;
use crate::config::Settings;
use crate::exit_codes::EXIT_SUCCESS;

pub mod archive;
pub mod author;
pub mod materialize;
pub mod resolve;

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    if let Command::Version = cli.cmd {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(EXIT_SUCCESS);
    }

    let settings = Settings::from_env()?;
    match cli.cmd {
        Command::Resolve(args) => resolve::run(args, &settings).await,
        Command::Materialize(args) => materialize::run(args, &settings).await,
        Command::Export(args) => archive::cmd_export(args).await,
        Command::Import(args) => archive::cmd_import(args).await,
        Command::Scan(args) => author::cmd_scan(args).await,
        Command::Plan(args) => author::cmd_plan(args).await,
        Command::Push(args) => author::cmd_push(args, &settings).await,
        Command::Version => Ok(EXIT_SUCCESS),
    }
}

/// Parse a command-line reference. An existing directory is a local
/// reference even without a `./` prefix.
pub(crate) fn parse_reference(text: &str) -> BundleResult<BundleRef> {
    let trimmed = text.trim();
    let (body, role) = match trimmed.rsplit_once('#') {
        Some((body, role)) => (body, Some(role)),
        None => (trimmed, None),
    };
    if !body.is_empty() && !body.starts_with("sha256:") && Path::new(body).is_dir() {
        let mut reference = BundleRef::local(body);
        if let Some(role) = role {
            // Reuse the parser's validation of the role suffix.
            reference.role = BundleRef::parse(&format!("./#{}", role))?.role;
        }
        return Ok(reference);
    }
    BundleRef::parse(trimmed)
}

/// Resolver over the configured registry, or local-only without one.
pub(crate) fn build_resolver(
    settings: &Settings,
    cache: Option<ContentCache>,
    config: ResolverConfig,
) -> BundleResult<BundleResolver> {
    let mut resolver = match settings.registry_client()? {
        Some(registry) => BundleResolver::new(registry),
        None => BundleResolver::local_only(),
    };
    if let Some(cache) = cache {
        resolver = resolver.with_cache(cache);
    }
    Ok(resolver.with_config(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{ErrorKind, Selector};

    #[test]
    fn test_existing_directory_is_local() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bundle")).unwrap();
        let cwd_relative = dir.path().join("bundle");
        let text = format!("{}#training", cwd_relative.display());

        let reference = parse_reference(&text).unwrap();
        assert_eq!(reference.local_path.as_deref(), Some(cwd_relative.as_path()));
        assert_eq!(reference.role.as_deref(), Some("training"));
    }

    #[test]
    fn test_named_and_digest_references() {
        let reference = parse_reference("team/churn:1.4.0#default").unwrap();
        assert_eq!(
            reference.selector().unwrap(),
            Selector::NameVersion {
                name: "team/churn",
                version: "1.4.0"
            }
        );
        assert_eq!(reference.role.as_deref(), Some("default"));

        let digest = format!("sha256:{}", "ab".repeat(32));
        let reference = parse_reference(&digest).unwrap();
        assert_eq!(reference.digest.as_deref(), Some(digest.as_str()));
    }

    #[test]
    fn test_malformed_reference() {
        let err = parse_reference("no-version-here").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let dir = tempfile::tempdir().unwrap();
        let err = parse_reference(&format!("{}#", dir.path().display())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}

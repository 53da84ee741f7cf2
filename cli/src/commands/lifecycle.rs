//! `dockyard lifecycle` commands: retention policies on ECR repositories.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Subcommand};
use dockyard_core::{EventEmitter, PipelineConfig, PipelineError, RegistryConfig, Result};
use dockyard_pipeline::lifecycle::{CountType, Rule};
use dockyard_pipeline::{
    ApplyOutcome, AwsCliBackend, LifecycleManager, LifecyclePolicy, PolicyState,
};

use crate::output;

#[derive(Subcommand)]
pub enum LifecycleCommand {
    /// Upload a policy, replacing the repository's current one
    Apply(ApplyArgs),
    /// Show the repository's active policy
    Verify(VerifyArgs),
    /// List images the policy would expire (dry run)
    Evaluate(EvaluateArgs),
    /// Check a policy file without contacting a registry
    Validate(ValidateArgs),
}

#[derive(Args)]
pub struct TargetArgs {
    /// Repository name, e.g. myapp
    pub repository: String,

    /// ECR registry name from the config file (default: the only ECR registry)
    #[arg(long)]
    pub registry: Option<String>,
}

#[derive(Args)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Policy document (JSON)
    pub policy_file: PathBuf,
}

#[derive(Args)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Print the policy document instead of a rule table
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct EvaluateArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Evaluate this policy file instead of the active policy
    #[arg(long)]
    pub policy: Option<PathBuf>,
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Policy document (JSON)
    pub policy_file: PathBuf,
}

pub async fn execute(command: LifecycleCommand, config_path: &Path) -> Result<()> {
    match command {
        LifecycleCommand::Apply(args) => apply(args, config_path).await,
        LifecycleCommand::Verify(args) => verify(args, config_path).await,
        LifecycleCommand::Evaluate(args) => evaluate(args, config_path).await,
        LifecycleCommand::Validate(args) => validate(args),
    }
}

async fn apply(args: ApplyArgs, config_path: &Path) -> Result<()> {
    let policy = LifecyclePolicy::from_file(&args.policy_file)?;
    let manager = manager(&args.target, config_path)?;
    let repository = &args.target.repository;

    match manager.apply(repository, &policy).await? {
        ApplyOutcome::Created => println!("Lifecycle policy created for {repository}"),
        ApplyOutcome::Replaced { .. } => println!("Lifecycle policy replaced for {repository}"),
        ApplyOutcome::Unchanged => println!("Lifecycle policy for {repository} is unchanged"),
    }
    Ok(())
}

async fn verify(args: VerifyArgs, config_path: &Path) -> Result<()> {
    let manager = manager(&args.target, config_path)?;
    let repository = &args.target.repository;
    match manager.verify(repository).await? {
        PolicyState::Absent => println!("No lifecycle policy on {repository}"),
        PolicyState::Applied(policy) if args.json => println!("{}", policy.to_pretty_json()?),
        PolicyState::Applied(policy) => {
            let mut table =
                output::new_table(&["PRIORITY", "TAG STATUS", "PREFIXES", "RULE", "DESCRIPTION"]);
            for rule in policy.ordered_rules() {
                table.add_row([
                    rule.rule_priority.to_string(),
                    serde_json::to_value(rule.selection.tag_status)?
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    rule.selection
                        .tag_prefix_list
                        .as_ref()
                        .map(|p| p.join(","))
                        .unwrap_or_default(),
                    describe_count(rule),
                    rule.description.clone().unwrap_or_default(),
                ]);
            }
            println!("{table}");
        }
    }
    Ok(())
}

async fn evaluate(args: EvaluateArgs, config_path: &Path) -> Result<()> {
    let manager = manager(&args.target, config_path)?;
    let repository = &args.target.repository;
    let now = chrono::Utc::now();

    let expiring = match args.policy {
        Some(ref path) => {
            let policy = LifecyclePolicy::from_file(path)?;
            manager.evaluate_policy(repository, &policy, now).await?
        }
        None => manager.evaluate(repository, now).await?,
    };

    if expiring.is_empty() {
        println!("No images in {repository} would expire");
        return Ok(());
    }

    let mut table = output::new_table(&["DIGEST", "TAGS", "PUSHED", "SIZE", "RULE"]);
    for entry in &expiring {
        let tags = if entry.image.tags.is_empty() {
            "<untagged>".to_string()
        } else {
            entry.image.tags.join(",")
        };
        table.add_row([
            output::short_digest(&entry.image.digest),
            tags,
            output::format_ago(&entry.image.pushed_at),
            output::format_bytes(entry.image.size),
            entry.rule_priority.to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn validate(args: ValidateArgs) -> Result<()> {
    let policy = LifecyclePolicy::from_file(&args.policy_file)?;
    println!(
        "{} is valid ({} rules)",
        args.policy_file.display(),
        policy.rules.len()
    );
    Ok(())
}

fn describe_count(rule: &Rule) -> String {
    let n = rule.selection.count_number;
    match rule.selection.count_type {
        CountType::ImageCountMoreThan => format!("keep newest {n}"),
        CountType::SinceImagePushed => format!("expire after {n} days"),
    }
}

fn manager(target: &TargetArgs, config_path: &Path) -> Result<LifecycleManager> {
    let config = super::load_config(config_path)?;
    let (region, account_id) = ecr_registry(&config, target.registry.as_deref())?;
    let backend = AwsCliBackend::new(region, Some(account_id));
    Ok(LifecycleManager::new(Arc::new(backend), EventEmitter::default()))
}

/// Region and account of the ECR registry to manage.
fn ecr_registry(config: &PipelineConfig, name: Option<&str>) -> Result<(String, String)> {
    let ecr = |registry: &RegistryConfig| match registry {
        RegistryConfig::Ecr { account_id, region } => Some((region.clone(), account_id.clone())),
        _ => None,
    };

    match name {
        Some(name) => ecr(config.registry(name)?).ok_or_else(|| {
            PipelineError::ConfigError(format!(
                "registry '{}' is not an ECR registry; lifecycle policies need ECR",
                name
            ))
        }),
        None => {
            let mut candidates = config.registries.values().filter_map(ecr);
            match (candidates.next(), candidates.next()) {
                (Some(found), None) => Ok(found),
                (None, _) => Err(PipelineError::ConfigError(
                    "no ECR registry configured".to_string(),
                )),
                (Some(_), Some(_)) => Err(PipelineError::ConfigError(
                    "several ECR registries configured; pass --registry".to_string(),
                )),
            }
        }
    }
}

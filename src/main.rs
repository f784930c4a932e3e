use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use taskweave_core::config::AppConfig;
use taskweave_core::instance::{Subdivision, TaskInstance};
use taskweave_core::template::WorkflowDesign;
use taskweave_core::types::{InstanceId, SubdivisionId, TaskId, TemplateId};
use taskweave_engine::{
    Engine, EventJournal, MergeCandidate, MergeOptions, SubWorkflow, SubdivisionRequest,
};
use taskweave_store::SqliteStore;

#[derive(Parser)]
#[command(
    name = "taskweave",
    version,
    about = "Recursive workflow engine for human and agent tasks"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "taskweave.toml", env = "TASKWEAVE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current configuration
    Config,
    /// Manage workflow templates
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },
    /// Create and start an instance of a template
    Start {
        template: String,
        /// Workflow context as JSON
        #[arg(long, default_value = "{}")]
        context: String,
        /// Create the instance without starting it
        #[arg(long)]
        pending: bool,
    },
    /// Show an instance and its nodes
    Status { instance: String },
    /// List tasks of an instance
    Tasks {
        instance: String,
        /// Include closed tasks
        #[arg(long)]
        all: bool,
    },
    /// Work on a single task
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Cancel an instance and its child instances
    Cancel { instance: String },
    /// Decompose tasks into child workflows
    Subdivision {
        #[command(subcommand)]
        action: SubdivisionAction,
    },
    /// Show the subdivision tree below an instance
    Tree {
        instance: String,
        /// Depth limit (default: aggregator.max_depth)
        #[arg(long)]
        depth: Option<usize>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Fold completed subdivisions back into the template
    Merge {
        #[command(subcommand)]
        action: MergeAction,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// Import a design from a TOML or JSON file
    Import { file: PathBuf },
    /// Print a stored template as JSON
    Show { id: String },
    /// List stored templates
    List,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Claim a ready task
    Start { id: String },
    /// Submit a task result (JSON, or a plain string)
    Submit { id: String, result: String },
    /// Mark a task failed
    Fail { id: String, error: String },
    /// Reopen a failed task
    Retry { id: String },
    /// Park a running task
    Block { id: String },
    /// Resume a blocked task
    Resume { id: String },
    /// Print a task as JSON
    Show { id: String },
}

#[derive(Subcommand)]
enum SubdivisionAction {
    /// Subdivide a task into a child workflow
    Create {
        task: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Design file for a new sub-workflow
        #[arg(long, conflicts_with = "template", required_unless_present = "template")]
        design: Option<PathBuf>,
        /// Reuse a stored template
        #[arg(long)]
        template: Option<String>,
        /// Submit the child's result to the task automatically
        #[arg(long)]
        auto_submit: bool,
        /// Create the child without starting it
        #[arg(long)]
        dormant: bool,
    },
    /// Start a dormant subdivision
    Start { id: String },
    /// List subdivisions of a task
    List {
        task: String,
        /// Only subdivisions that produced a child instance
        #[arg(long)]
        active: bool,
    },
}

#[derive(Subcommand)]
enum MergeAction {
    /// List merge candidates of an instance
    Candidates { instance: String },
    /// Show what merging the selected subdivisions would change
    Preview {
        instance: String,
        /// Subdivision ids (default: every selectable candidate)
        #[arg(long = "select")]
        select: Vec<String>,
    },
    /// Commit the merge as a new template version
    Execute {
        instance: String,
        #[arg(long = "select")]
        select: Vec<String>,
        /// Mark the source version superseded
        #[arg(long)]
        supersede: bool,
        /// Name of the new version
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("taskweave=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "taskweave", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    if let Commands::Config = &cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let db_path = config.store_path();
    let store = Arc::new(SqliteStore::open(&db_path)?);
    let engine = Engine::from_config(store, &config);

    let cancel = CancellationToken::new();
    let journal = config.log_dir().map(|dir| {
        let level = config.log.as_ref().map(|l| l.level).unwrap_or(2);
        EventJournal::new(dir, level).spawn(&engine.event_bus(), cancel.clone())
    });

    let outcome = run(&engine, &config, cli.command);

    cancel.cancel();
    if let Some(handle) = journal {
        handle.await.ok();
    }
    outcome
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".taskweave").join("config.toml"));
    match home_config {
        Some(path) if path.exists() => {
            info!(path = %path.display(), "Loading config from home directory");
            Ok(AppConfig::load(&path)?)
        }
        _ => Ok(AppConfig::default()),
    }
}

fn run(engine: &Engine, config: &AppConfig, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Config | Commands::Completions { .. } => {}
        Commands::Template { action } => match action {
            TemplateAction::Import { file } => {
                let template = engine.import_template(read_design(&file)?)?;
                println!("{}", template.id);
            }
            TemplateAction::Show { id } => {
                let template = engine.get_template(&TemplateId::from_str(&id))?;
                println!("{}", serde_json::to_string_pretty(&template)?);
            }
            TemplateAction::List => {
                for t in engine.list_templates()? {
                    let superseded = if t.superseded_by.is_some() { " (superseded)" } else { "" };
                    println!(
                        "{}  v{:<3} {:<24} {} nodes{}",
                        t.id,
                        t.version,
                        truncate(&t.name, 24),
                        t.nodes.len(),
                        superseded
                    );
                }
            }
        },
        Commands::Start {
            template,
            context,
            pending,
        } => {
            let context: Value = serde_json::from_str(&context).context("--context is not JSON")?;
            let template = TemplateId::from_str(&template);
            let instance = if pending {
                engine.create_instance(&template, context)?
            } else {
                engine.launch(&template, context)?
            };
            println!("{}", instance.id);
        }
        Commands::Status { instance } => {
            let id = InstanceId::from_str(&instance);
            let instance = engine.get_instance(&id)?;
            let stats = engine.stats(&id)?;
            println!(
                "{} [{}] {:.0}% complete",
                instance.id, instance.status, stats.percent_complete
            );
            if let Some(error) = &instance.error {
                println!("  error: {}", error);
            }
            for node in engine.list_nodes(&id)? {
                println!("  {:<24} {}", truncate(&node.node_key, 24), node.status);
            }
        }
        Commands::Tasks { instance, all } => {
            let id = InstanceId::from_str(&instance);
            let tasks = if all {
                engine.list_tasks(&id)?
            } else {
                engine.open_tasks(&id)?
            };
            for task in &tasks {
                print_task_line(task);
            }
        }
        Commands::Task { action } => run_task(engine, action)?,
        Commands::Cancel { instance } => {
            engine.cancel_instance(&InstanceId::from_str(&instance))?;
        }
        Commands::Subdivision { action } => run_subdivision(engine, action)?,
        Commands::Tree {
            instance,
            depth,
            json,
        } => {
            let depth = depth.unwrap_or(config.aggregator.max_depth);
            let tree = engine.build_subdivision_tree(&InstanceId::from_str(&instance), depth)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tree)?);
            } else {
                print!("{}", tree.render());
            }
        }
        Commands::Merge { action } => run_merge(engine, config, action)?,
    }
    Ok(())
}

fn run_task(engine: &Engine, action: TaskAction) -> anyhow::Result<()> {
    match action {
        TaskAction::Start { id } => engine.start_task(&TaskId::from_str(&id))?,
        TaskAction::Submit { id, result } => {
            // Anything that is not JSON is taken as a plain string result.
            let value = serde_json::from_str(&result).unwrap_or(Value::String(result));
            engine.submit_result(&TaskId::from_str(&id), value)?;
        }
        TaskAction::Fail { id, error } => engine.fail_task(&TaskId::from_str(&id), &error)?,
        TaskAction::Retry { id } => {
            let task = engine.retry_task(&TaskId::from_str(&id))?;
            println!("{} attempt {}", task.id, task.attempt);
        }
        TaskAction::Block { id } => engine.block_task(&TaskId::from_str(&id))?,
        TaskAction::Resume { id } => engine.resume_task(&TaskId::from_str(&id))?,
        TaskAction::Show { id } => {
            let task = engine.get_task(&TaskId::from_str(&id))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
    }
    Ok(())
}

fn run_subdivision(engine: &Engine, action: SubdivisionAction) -> anyhow::Result<()> {
    match action {
        SubdivisionAction::Create {
            task,
            name,
            description,
            design,
            template,
            auto_submit,
            dormant,
        } => {
            let workflow = match (design, template) {
                (Some(file), _) => SubWorkflow::Design(read_design(&file)?),
                (None, Some(id)) => SubWorkflow::Template(TemplateId::from_str(&id)),
                (None, None) => anyhow::bail!("either --design or --template is required"),
            };
            let request = SubdivisionRequest::new(name, workflow)
                .with_description(description)
                .auto_submit(auto_submit)
                .execute_immediately(!dormant);
            let sub = engine.subdivide(&TaskId::from_str(&task), request)?;
            print_subdivision_line(&sub);
        }
        SubdivisionAction::Start { id } => {
            engine.start_subdivision(&SubdivisionId::from_str(&id))?;
        }
        SubdivisionAction::List { task, active } => {
            for sub in engine.subdivisions(&TaskId::from_str(&task), active)? {
                print_subdivision_line(&sub);
            }
        }
    }
    Ok(())
}

fn run_merge(engine: &Engine, config: &AppConfig, action: MergeAction) -> anyhow::Result<()> {
    match action {
        MergeAction::Candidates { instance } => {
            let candidates = engine.compute_merge_candidates(&InstanceId::from_str(&instance))?;
            if candidates.is_empty() {
                println!("No completed subdivisions.");
            }
            for c in &candidates {
                match &c.reason {
                    None => println!(
                        "{}  {:<16} -> {} ({:?})",
                        c.subdivision_id,
                        truncate(&c.target_node, 16),
                        c.name,
                        c.complexity
                    ),
                    Some(reason) => println!(
                        "{}  {:<16} -> {} [incompatible: {}]",
                        c.subdivision_id,
                        truncate(&c.target_node, 16),
                        c.name,
                        reason
                    ),
                }
                for note in &c.notes {
                    println!("    {}", note);
                }
            }
        }
        MergeAction::Preview { instance, select } => {
            let selected = select_candidates(engine, &instance, &select)?;
            let options = MergeOptions::from(&config.merge);
            let preview = engine.preview_merge_with(&selected, &options)?;
            println!("{}", serde_json::to_string_pretty(&preview)?);
        }
        MergeAction::Execute {
            instance,
            select,
            supersede,
            name,
        } => {
            let selected = select_candidates(engine, &instance, &select)?;
            let mut options = MergeOptions::from(&config.merge);
            options.supersede_original |= supersede;
            options.name = name;
            let parent = match selected.first() {
                Some(c) => c.parent_template_id.clone(),
                None => anyhow::bail!("nothing to merge"),
            };
            let id = engine.execute_merge(&parent, &selected, &options)?;
            println!("{}", id);
        }
    }
    Ok(())
}

/// The requested candidates, or every selectable one when none are named.
fn select_candidates(
    engine: &Engine,
    instance: &str,
    select: &[String],
) -> anyhow::Result<Vec<MergeCandidate>> {
    let candidates = engine.compute_merge_candidates(&InstanceId::from_str(instance))?;
    if select.is_empty() {
        return Ok(candidates.into_iter().filter(|c| c.is_selectable()).collect());
    }
    select
        .iter()
        .map(|id| {
            candidates
                .iter()
                .find(|c| c.subdivision_id.as_str() == id)
                .cloned()
                .with_context(|| format!("{} is not a merge candidate of {}", id, instance))
        })
        .collect()
}

fn read_design(path: &Path) -> anyhow::Result<WorkflowDesign> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let design = if path.extension().is_some_and(|e| e == "json") {
        serde_json::from_str(&content)?
    } else {
        toml::from_str(&content)?
    };
    Ok(design)
}

fn print_task_line(task: &TaskInstance) {
    let reference = if task.reference_result.is_some() { " [reference]" } else { "" };
    println!(
        "{}  {:<10} {:<16} {}{}",
        task.id,
        task.status.to_string(),
        truncate(&task.node_key, 16),
        task.title,
        reference
    );
}

fn print_subdivision_line(sub: &Subdivision) {
    let child = sub
        .child_instance_id
        .as_ref()
        .map(|c| c.short().to_string())
        .unwrap_or_else(|| "-".into());
    println!(
        "{}  {:<10} {} child={}{}",
        sub.id,
        sub.status.to_string(),
        sub.name,
        child,
        sub.error
            .as_deref()
            .map(|e| format!(" error: {}", e))
            .unwrap_or_default()
    );
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

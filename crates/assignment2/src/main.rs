//! `infra`: synthesize, plan, deploy and destroy the assignment2 stack.
//!
//! ```sh
//! RUST_LOG=info infra synth
//! RUST_LOG=info infra deploy
//! infra destroy --force
//! ```
use std::path::PathBuf;

use assignment2::{Assignment2Stack, StackProps};
use clap::{Parser, Subcommand};
use form::{aws::Aws, Plan, Stack};

#[derive(Parser)]
#[command(name = "infra", version, about = "Manage the assignment2 stack")]
struct Cli {
    /// Directory for state files.
    #[arg(long, env = "INFRA_STATE_DIR", default_value = "state")]
    state_dir: PathBuf,

    /// Id of the stack, also the prefix of generated names.
    #[arg(long, env = "INFRA_STACK_ID", default_value = "assignment2")]
    stack_id: String,

    /// TOML file of stack properties.
    #[arg(long, env = "INFRA_PROPS")]
    props: Option<PathBuf>,

    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    #[arg(long, env = "AWS_PROFILE")]
    profile: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the synthesized template.
    Synth {
        /// Write the template here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show what would change without applying.
    Plan,
    /// Plan and apply changes.
    Deploy,
    /// Tear down every construct of the stack.
    Destroy {
        #[clap(long, short, default_value = "false")]
        force: bool,
    },
    /// Write the apply graph as a graphviz dot file.
    Graph {
        #[arg(long)]
        out: PathBuf,
    },
}

fn print_plan(plan: &Plan<Aws>) {
    println!("Plan:\n{plan}");
    print!("{}", plan.schedule_string());
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let props = cli.props.as_deref().map(StackProps::from_file).transpose()?;
    let aws = Aws::load(cli.region.clone(), cli.profile.clone()).await;
    log::info!(
        "using region {}",
        aws.region().unwrap_or("<none, set AWS_REGION or --region>")
    );
    let mut stack = Stack::new(&cli.stack_id, &cli.state_dir, aws);
    form::aws::register_all(&mut stack);
    let handles = Assignment2Stack::define(&mut stack, &cli.stack_id, props)?;

    match cli.command {
        Command::Synth { out } => {
            let template = stack.synth();
            let json = template.to_json_pretty()?;
            match out {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    println!("Wrote {} constructs to {path:?}", template.resources.len());
                }
                None => println!("{json}"),
            }
        }
        Command::Plan => {
            let plan = stack.plan()?;
            print_plan(&plan);
        }
        Command::Deploy => {
            let plan = stack.plan()?;
            print_plan(&plan);
            println!();
            println!("Applying...");
            stack.apply(plan).await?;
            if let Some(bucket) = handles.bucket.output() {
                println!("bucket:   {}", bucket.name);
            }
            if let Some(function) = handles.function.output() {
                println!("function: {}", function.arn);
            }
            if let Some(table) = handles.table.output() {
                println!("table:    {}", table.arn);
            }
            println!("Done.");
        }
        Command::Destroy { force } => {
            // Everything with state becomes an orphan, dependents go first.
            stack.clear_resources();
            let plan = stack.plan()?;
            print_plan(&plan);
            if force {
                println!();
                println!("Applying...");
                stack.apply(plan).await?;
                println!("Done.");
            } else {
                println!();
                println!("Please call `destroy --force` to delete these resources.");
            }
        }
        Command::Graph { out } => {
            stack.save_apply_graph(&out)?;
            println!("Wrote apply graph to {out:?}");
        }
    }
    Ok(())
}

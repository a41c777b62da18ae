// project.rs — Project subcommands: create, list, show, transition,
// ready, approve.

use clap::Subcommand;
use fm_engine::{EngineConfig, StateMachine};
use fm_store::{Project, ProjectState, TaskCard};

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// File a new project in the inbox.
    Create {
        /// Project id (also its directory name).
        id: String,
        /// Human-readable display name.
        name: String,
        /// Scheduling priority, 0-100.
        #[arg(long, default_value_t = 50)]
        priority: u8,
        /// Require a human checkpoint before completion.
        #[arg(long)]
        checkpoint: bool,
        /// Task cards as "id" or "id:dep1+dep2", in sequence order.
        #[arg(long = "task")]
        tasks: Vec<String>,
    },
    /// List projects, optionally one bucket only.
    List {
        /// Bucket to list (e.g., "backlog", "active").
        #[arg(long)]
        state: Option<ProjectState>,
    },
    /// Show one project and its cards.
    Show {
        /// Project id.
        id: String,
    },
    /// Execute a validated state transition.
    Transition {
        /// Project id.
        id: String,
        /// The state the caller believes the project is in.
        from: ProjectState,
        /// The target state.
        to: ProjectState,
        /// Reason (recorded on failure transitions).
        #[arg(long)]
        reason: Option<String>,
        /// Skip the transition table and guards (privileged).
        #[arg(long)]
        force: bool,
    },
    /// Show the cards currently eligible for claiming.
    Ready {
        /// Project id.
        id: String,
    },
    /// Approve the project's human checkpoint.
    Approve {
        /// Project id.
        id: String,
        /// Who is approving.
        #[arg(long, default_value = "operator")]
        by: String,
    },
}

pub fn execute(cmd: &ProjectCommands, config: &EngineConfig) -> anyhow::Result<()> {
    let machine = StateMachine::new(config.clone())?;

    match cmd {
        ProjectCommands::Create {
            id,
            name,
            priority,
            checkpoint,
            tasks,
        } => {
            let mut project = Project::new(id, name);
            project.priority = *priority;
            project.checkpoint_required = *checkpoint;
            for (sequence, raw) in tasks.iter().enumerate() {
                project.push_task(parse_task(raw, sequence as u32)?);
            }
            let persisted = machine.create_project(&project)?;
            println!(
                "filed {} in inbox ({} cards, version {})",
                persisted.project_id,
                persisted.cards_total,
                persisted.version
            );
        }

        ProjectCommands::List { state } => {
            let projects = match state {
                Some(state) => machine.store().list(*state)?,
                None => machine.store().list_all()?,
            };
            if projects.is_empty() {
                println!("no projects");
            }
            for p in projects {
                println!(
                    "{:<12} {:<10} prio {:<3} cards {}/{}  {}",
                    p.project_id, p.state, p.priority, p.cards_completed, p.cards_total, p.name
                );
            }
        }

        ProjectCommands::Show { id } => {
            let (p, version) = machine.store().read(id)?;
            println!("{} — {}", p.project_id, p.name);
            println!("  state:      {} (version {})", p.state, version);
            println!("  priority:   {}", p.priority);
            println!(
                "  checkpoint: required={} approved={}",
                p.checkpoint_required, p.checkpoint_approved
            );
            if let Some(reason) = &p.failure_reason {
                println!("  failed:     {}", reason);
            }
            println!(
                "  cards:      {}/{} completed, {} failed",
                p.cards_completed, p.cards_total, p.cards_failed
            );
            for card in &p.tasks {
                let assignee = card.assignee.as_deref().unwrap_or("-");
                let blocked = machine
                    .blocked_reason(id, &card.task_id)?
                    .map(|r| format!("  [{}]", r))
                    .unwrap_or_default();
                println!(
                    "    {:<10} {:<12} assignee {}{}",
                    card.task_id, card.state, assignee, blocked
                );
            }
        }

        ProjectCommands::Transition {
            id,
            from,
            to,
            reason,
            force,
        } => {
            let persisted =
                machine.transition(id, *from, *to, reason.as_deref(), *force)?;
            println!("{}: {} -> {}", id, from, persisted.state);
        }

        ProjectCommands::Ready { id } => {
            let ready = machine.ready_tasks(id)?;
            if ready.is_empty() {
                println!("no ready cards");
            }
            for task_id in ready {
                println!("{}", task_id);
            }
        }

        ProjectCommands::Approve { id, by } => {
            machine.approve_checkpoint(id, by)?;
            println!("checkpoint approved on {} by {}", id, by);
        }
    }

    Ok(())
}

/// Parse "id" or "id:dep1+dep2" into a card.
fn parse_task(raw: &str, sequence: u32) -> anyhow::Result<TaskCard> {
    match raw.split_once(':') {
        None => Ok(TaskCard::new(raw, sequence)),
        Some((id, deps)) => {
            let deps: Vec<String> = deps
                .split('+')
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect();
            Ok(TaskCard::new(id, sequence).with_dependencies(deps))
        }
    }
}

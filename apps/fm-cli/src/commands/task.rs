// task.rs — Task subcommands: claim, complete, fail.
//
// These drive cards exactly the way a worker agent does, which makes
// the CLI handy for re-driving stuck work by hand.

use clap::Subcommand;
use fm_engine::{EngineConfig, StateMachine};

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Claim a pending, unblocked card.
    Claim {
        /// Project id.
        project: String,
        /// Card id.
        task: String,
        /// Worker identity to claim as.
        #[arg(long, default_value = "operator")]
        worker: String,
    },
    /// Complete a claimed card.
    Complete {
        /// Project id.
        project: String,
        /// Card id.
        task: String,
        /// Worker identity holding the card.
        #[arg(long, default_value = "operator")]
        worker: String,
    },
    /// Fail a claimed card (requeues while retries remain).
    Fail {
        /// Project id.
        project: String,
        /// Card id.
        task: String,
        /// Worker identity holding the card.
        #[arg(long, default_value = "operator")]
        worker: String,
        /// Why the card failed.
        #[arg(long, default_value = "failed by operator")]
        reason: String,
    },
}

pub fn execute(cmd: &TaskCommands, config: &EngineConfig) -> anyhow::Result<()> {
    let machine = StateMachine::new(config.clone())?;

    match cmd {
        TaskCommands::Claim {
            project,
            task,
            worker,
        } => {
            machine.claim(project, task, worker)?;
            println!("{}/{} claimed by {}", project, task, worker);
        }
        TaskCommands::Complete {
            project,
            task,
            worker,
        } => {
            let persisted = machine.complete_task(project, task, worker)?;
            println!(
                "{}/{} completed ({}/{} cards done)",
                project, task, persisted.cards_completed, persisted.cards_total
            );
        }
        TaskCommands::Fail {
            project,
            task,
            worker,
            reason,
        } => {
            let persisted = machine.fail_task(project, task, worker, reason)?;
            let card = persisted
                .tasks
                .iter()
                .find(|c| &c.task_id == task)
                .map(|c| c.state.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            println!("{}/{} failed, card now {}", project, task, card);
        }
    }

    Ok(())
}

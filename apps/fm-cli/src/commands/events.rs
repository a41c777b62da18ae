// events.rs — Event feed subcommands: tail, follow.

use std::io::{BufRead, BufReader};
use std::sync::Arc;

use clap::Subcommand;
use fm_engine::{CallbackSink, ChangeEvent, EngineConfig, StateMachine};
use fm_watch::ChangeNotifier;

#[derive(Subcommand)]
pub enum EventCommands {
    /// Print the last events from the feed.
    Tail {
        /// How many events to show.
        #[arg(long, default_value_t = 20)]
        count: usize,
    },
    /// Watch the board and print events live (Ctrl-C to stop).
    Follow,
}

pub fn execute(cmd: &EventCommands, config: &EngineConfig) -> anyhow::Result<()> {
    match cmd {
        EventCommands::Tail { count } => {
            let file = match std::fs::File::open(&config.events_log) {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    println!("no events yet");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            let lines: Vec<String> = BufReader::new(file)
                .lines()
                .collect::<Result<_, _>>()?;
            for line in lines.iter().rev().take(*count).rev() {
                print_event(line);
            }
        }

        EventCommands::Follow => {
            let machine = Arc::new(StateMachine::new(config.clone())?);
            machine.subscribe(Box::new(CallbackSink(|event: &ChangeEvent| {
                if let Ok(json) = serde_json::to_string(event) {
                    print_event(&json);
                }
            })));

            let mut notifier = ChangeNotifier::new(Arc::clone(&machine));
            notifier.on_watch_error(Box::new(|err| {
                eprintln!("watch error (restarting): {}", err);
            }));
            notifier.start()?;
            println!(
                "following {} (Ctrl-C to stop)",
                config.board_root.display()
            );

            loop {
                std::thread::park();
            }
        }
    }

    Ok(())
}

/// One human-readable line per event; falls back to the raw JSON.
fn print_event(json: &str) {
    match serde_json::from_str::<ChangeEvent>(json) {
        Ok(ChangeEvent::ProjectStateChanged {
            project_id,
            from_state,
            to_state,
            cause,
            timestamp,
            ..
        }) => println!(
            "{}  {:?}  {} {} -> {}",
            timestamp.format("%H:%M:%S"),
            cause,
            project_id,
            from_state,
            to_state
        ),
        Ok(ChangeEvent::TaskStateChanged {
            project_id,
            task_id,
            from_state,
            to_state,
            cause,
            timestamp,
            ..
        }) => println!(
            "{}  {:?}  {}/{} {} -> {}",
            timestamp.format("%H:%M:%S"),
            cause,
            project_id,
            task_id,
            from_state,
            to_state
        ),
        Err(_) => println!("{}", json),
    }
}

// board.rs — Board initialization.

use fm_engine::{EngineConfig, StateMachine};
use fm_store::ProjectState;

/// Create the bucket tree and lock directory for a fresh board.
pub fn init(config: &EngineConfig) -> anyhow::Result<()> {
    StateMachine::new(config.clone())?;

    println!("board initialized at {}", config.board_root.display());
    for state in ProjectState::ALL {
        println!("  {}/", state.bucket());
    }
    println!("  .locks/");
    Ok(())
}

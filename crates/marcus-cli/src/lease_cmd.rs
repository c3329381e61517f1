//! Operator-facing lease administration (`marcus lease force-release`).

use std::sync::Arc;

use marcus_core::events::EventBus;
use marcus_core::lease::LeaseManager;
use marcus_db::ledger::AssignmentLedger;

use crate::config::MarcusConfig;
use crate::LeaseCommands;

pub async fn run(cfg: &MarcusConfig, command: LeaseCommands) -> anyhow::Result<()> {
    let ledger = Arc::new(AssignmentLedger::open(&cfg.data_dir, false));
    let events = Arc::new(EventBus::new(cfg.event_queue_max));
    let lease_manager = LeaseManager::new(ledger, events, cfg.lease_config);

    match command {
        LeaseCommands::ForceRelease { task_id, reason } => {
            lease_manager.force_release(&task_id, &reason).await?;
            println!("Released lease for task {task_id} ({reason}).");
        }
    }
    Ok(())
}

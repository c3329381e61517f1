//! Operator-facing ledger inspection (`marcus ledger show|clear`).

use marcus_db::ledger::AssignmentLedger;

use crate::config::MarcusConfig;
use crate::LedgerCommands;

pub async fn run(cfg: &MarcusConfig, command: LedgerCommands) -> anyhow::Result<()> {
    let ledger = AssignmentLedger::open(&cfg.data_dir, false);

    match command {
        LedgerCommands::Show => {
            let assignments = ledger.load().await?;
            if assignments.is_empty() {
                println!("No active assignments.");
                return Ok(());
            }
            let mut rows: Vec<_> = assignments.into_iter().collect();
            rows.sort_by(|a, b| a.0.cmp(&b.0));
            for (agent_id, assignment) in rows {
                println!(
                    "{agent_id}\ttask={}\tstatus={}\texpires={}\trenewals={}",
                    assignment.task_id, assignment.status, assignment.lease_expires_at, assignment.renewal_count
                );
            }
        }
        LedgerCommands::Clear => {
            let assignments = ledger.load().await?;
            let count = assignments.len();
            for agent_id in assignments.keys() {
                ledger.remove(agent_id).await?;
            }
            println!("Cleared {count} assignment(s) from the ledger.");
        }
    }
    Ok(())
}

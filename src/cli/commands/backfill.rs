//! `budgetvault backfill`: encrypt a user's remaining plaintext amounts.

use crate::cli::{output, prompt_client_secret, Cli, Context};
use crate::errors::{BudgetVaultError, Result};
use crate::workflows::{backfill_user_data, build_backfill_batch};

/// Execute the `backfill` command.
pub fn execute(cli: &Cli, user_id: &str, dry_run: bool) -> Result<()> {
    let ctx = Context::load(cli)?;
    let manager = ctx.manager()?;
    let ledger = ctx.ledger();
    let rt = crate::cli::runtime()?;

    rt.block_on(async {
        let iterations = ctx.kdf_iterations(user_id).await?;
        let secret = prompt_client_secret(user_id, iterations)?;
        if !manager.verify_and_ensure_key_check(user_id, &secret).await? {
            return Err(BudgetVaultError::CommandFailed(format!(
                "client secret does not match the key check for '{user_id}'"
            )));
        }
        let dek = manager.derive_or_get_dek(user_id, &secret).await?;
        drop(secret);

        if dry_run {
            match build_backfill_batch(user_id, &dek, ledger.as_ref()).await? {
                Some(batch) => {
                    let text = serde_json::to_string_pretty(&batch.to_payload())
                        .map_err(|e| BudgetVaultError::Serialization(e.to_string()))?;
                    println!("{text}");
                    output::print_batch_summary(&batch);
                    output::info("Dry run: nothing was written.");
                }
                None => output::info("Nothing to backfill."),
            }
            return Ok(());
        }

        backfill_user_data(user_id, &dek, ledger.as_ref()).await?;
        let statuses = ledger.count_rows(user_id).await?;
        output::print_status_table(&statuses);
        output::success(&format!("Backfill complete for '{user_id}'"));
        Ok::<(), BudgetVaultError>(())
    })
}

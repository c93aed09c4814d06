//! `budgetvault change-secret`: rotate a user's key after a credential change.

use dialoguer::Confirm;

use crate::cli::{output, prompt_client_secret, prompt_new_client_secret, Cli, Context, NEW_CLIENT_SECRET_ENV};
use crate::errors::{BudgetVaultError, Result};
use crate::workflows::change_client_secret;

/// Execute the `change-secret` command.
///
/// All of the user's encrypted amounts are re-encrypted under the new
/// key in one transaction.  Any existing recovery key stops working.
pub fn execute(cli: &Cli, user_id: &str) -> Result<()> {
    let ctx = Context::load(cli)?;
    let manager = ctx.manager()?;
    let rt = crate::cli::runtime()?;

    rt.block_on(async {
        let iterations = ctx.kdf_iterations(user_id).await?;
        let old_secret = prompt_client_secret(user_id, iterations)?;
        let new_secret = prompt_new_client_secret(user_id, iterations)?;

        // Scripted runs have already made their choice.
        if std::env::var(NEW_CLIENT_SECRET_ENV).is_err() {
            let proceed = Confirm::new()
                .with_prompt("Re-encrypt all data and invalidate the recovery key?")
                .default(false)
                .interact()
                .map_err(|e| BudgetVaultError::CommandFailed(format!("failed to read confirmation: {e}")))?;
            if !proceed {
                return Err(BudgetVaultError::UserCancelled);
            }
        }

        change_client_secret(&manager, ctx.ledger(), user_id, &old_secret, &new_secret).await
    })?;

    output::success(&format!("Client secret changed for '{user_id}'"));
    output::tip(&format!(
        "Run `budgetvault setup-recovery {user_id}` to create a new recovery key."
    ));
    Ok(())
}

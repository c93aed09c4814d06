//! `budgetvault verify`: check a client secret against the key check.

use crate::cli::{output, prompt_client_secret, Cli, Context};
use crate::errors::{BudgetVaultError, Result};

/// Execute the `verify` command.
///
/// Accounts without a key check get one created under the supplied
/// secret, as on first login.
pub fn execute(cli: &Cli, user_id: &str) -> Result<()> {
    let ctx = Context::load(cli)?;
    let manager = ctx.manager()?;
    let rt = crate::cli::runtime()?;

    let valid = rt.block_on(async {
        let iterations = ctx.kdf_iterations(user_id).await?;
        let secret = prompt_client_secret(user_id, iterations)?;
        manager.verify_and_ensure_key_check(user_id, &secret).await
    })?;

    if !valid {
        return Err(BudgetVaultError::CommandFailed(format!(
            "client secret does not match the key check for '{user_id}'"
        )));
    }
    output::success(&format!("Client secret verified for '{user_id}'"));
    Ok(())
}

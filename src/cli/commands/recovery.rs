//! `budgetvault setup-recovery` and `budgetvault recover`.

use console::style;

use crate::cli::{
    output, prompt_client_secret, prompt_new_client_secret, prompt_recovery_key, Cli, Context,
};
use crate::errors::Result;
use crate::workflows::recover_account;

/// Execute the `setup-recovery` command.
///
/// Prints the formatted recovery key exactly once.  It is not stored
/// anywhere and cannot be shown again.
pub fn execute_setup(cli: &Cli, user_id: &str) -> Result<()> {
    let ctx = Context::load(cli)?;
    let manager = ctx.manager()?;
    let rt = crate::cli::runtime()?;

    let formatted = rt.block_on(async {
        let iterations = ctx.kdf_iterations(user_id).await?;
        let secret = prompt_client_secret(user_id, iterations)?;
        manager.setup_recovery_key(user_id, &secret).await
    })?;

    output::success(&format!("Recovery key created for '{user_id}'"));
    println!("{}", style(formatted.as_str()).bold());
    output::warning("Write this key down now. It will not be shown again.");
    Ok(())
}

/// Execute the `recover` command.
pub fn execute_recover(cli: &Cli, user_id: &str) -> Result<()> {
    let ctx = Context::load(cli)?;
    let manager = ctx.manager()?;
    let rt = crate::cli::runtime()?;

    let formatted = prompt_recovery_key()?;

    rt.block_on(async {
        let iterations = ctx.kdf_iterations(user_id).await?;
        let new_secret = prompt_new_client_secret(user_id, iterations)?;
        recover_account(&manager, ctx.ledger(), user_id, &formatted, &new_secret).await
    })?;

    output::success(&format!("Account '{user_id}' recovered"));
    output::tip("The same recovery key keeps working with the new secret.");
    Ok(())
}

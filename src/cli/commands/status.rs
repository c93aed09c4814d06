//! `budgetvault status`: per-table encryption progress for a user.

use serde_json::json;

use crate::cli::{output, Cli, Context};
use crate::errors::{BudgetVaultError, Result};
use crate::store::{KeySaltStore, LedgerStore};

/// Execute the `status` command.  Needs no master key.
pub fn execute(cli: &Cli, user_id: &str, as_json: bool) -> Result<()> {
    let ctx = Context::load(cli)?;
    let rt = crate::cli::runtime()?;

    let (statuses, key_row) = rt.block_on(async {
        let statuses = ctx.store.count_rows(user_id).await?;
        let key_row = ctx.store.find_user_key_row(user_id).await?;
        Ok::<_, BudgetVaultError>((statuses, key_row))
    })?;

    if as_json {
        let body = json!({
            "user_id": user_id,
            "key_configured": key_row.is_some(),
            "key_check": key_row.as_ref().is_some_and(|r| r.key_check.is_some()),
            "recovery_configured": key_row.as_ref().is_some_and(|r| r.wrapped_dek.is_some()),
            "tables": statuses,
        });
        let text = serde_json::to_string_pretty(&body)
            .map_err(|e| BudgetVaultError::Serialization(e.to_string()))?;
        println!("{text}");
        return Ok(());
    }

    output::print_key_summary(user_id, key_row.as_ref());
    output::print_status_table(&statuses);

    let remaining: usize = statuses.iter().map(|s| s.plaintext).sum();
    if remaining > 0 {
        output::tip(&format!(
            "{remaining} plaintext amount(s) left. Run `budgetvault backfill {user_id}`."
        ));
    } else {
        output::success("All amounts are encrypted.");
    }
    Ok(())
}

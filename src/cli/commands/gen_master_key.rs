//! `budgetvault gen-master-key`: print a fresh random master key.

use crate::cli::output;
use crate::config::settings::MASTER_KEY_ENV;
use crate::crypto::keys::MasterKey;
use crate::errors::Result;

/// Execute the `gen-master-key` command.
///
/// The key goes to stdout on its own line so it can be captured by a
/// script; hints go to stdout after it, dimmed.
pub fn execute() -> Result<()> {
    let key = MasterKey::generate();
    let encoded = key.to_base64();
    println!("{}", encoded.as_str());
    output::tip(&format!(
        "Store this in {MASTER_KEY_ENV}. Losing it makes every user's data unreadable."
    ));
    Ok(())
}

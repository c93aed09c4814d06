//! Colored terminal output helpers.
//!
//! All user-facing output goes through these functions so we get
//! consistent styling across every command.

use comfy_table::{ContentArrangement, Table};
use console::style;

use crate::store::{EncryptedBatch, TableStatus, UserKeyRow};

/// Print a green success message: "check_mark {msg}"
pub fn success(msg: &str) {
    println!("{} {}", style("\u{2713}").green().bold(), msg);
}

/// Print a red error message: "x_mark {msg}"
pub fn error(msg: &str) {
    eprintln!("{} {}", style("\u{2717}").red().bold(), msg);
}

/// Print a yellow warning: "warning_sign {msg}"
pub fn warning(msg: &str) {
    eprintln!("{} {}", style("\u{26a0}").yellow().bold(), msg);
}

/// Print a blue info message: "info_sign {msg}"
pub fn info(msg: &str) {
    println!("{} {}", style("\u{2139}").blue().bold(), msg);
}

/// Print a dim tip/hint: "arrow {msg}"
pub fn tip(msg: &str) {
    println!("{} {}", style("\u{2192}").dim(), style(msg).dim());
}

/// Print per-table encrypted/plaintext counts.
pub fn print_status_table(statuses: &[TableStatus]) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Table", "Encrypted", "Plaintext"]);

    for s in statuses {
        let plaintext = if s.plaintext > 0 {
            style(s.plaintext.to_string()).yellow().to_string()
        } else {
            s.plaintext.to_string()
        };
        table.add_row(vec![
            s.table.table_name().to_string(),
            s.encrypted.to_string(),
            plaintext,
        ]);
    }

    println!("{table}");
}

/// Print which key artifacts exist for a user.  Never prints their values.
pub fn print_key_summary(user_id: &str, row: Option<&UserKeyRow>) {
    let Some(row) = row else {
        info(&format!("No encryption key configured for '{user_id}' yet."));
        return;
    };

    let yes_no = |present: bool| if present { "yes" } else { "no" };
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Key artifact", "Status"]);
    table.add_row(vec!["salt".to_string(), format!("{} bytes", row.salt.len())]);
    table.add_row(vec!["kdf iterations".to_string(), row.kdf_iterations.to_string()]);
    table.add_row(vec!["key check".to_string(), yes_no(row.key_check.is_some()).to_string()]);
    table.add_row(vec!["recovery key".to_string(), yes_no(row.wrapped_dek.is_some()).to_string()]);

    println!("{table}");
}

/// Print how many rows of each table a batch touches.
pub fn print_batch_summary(batch: &EncryptedBatch) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Table", "Rows"]);
    for t in crate::store::AmountTable::ALL {
        table.add_row(vec![t.table_name().to_string(), batch.list(t).len().to_string()]);
    }
    println!("{table}");
}

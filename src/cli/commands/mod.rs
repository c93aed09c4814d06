//! One module per subcommand.  Each exposes `execute`.

pub mod backfill;
pub mod change_secret;
pub mod gen_master_key;
pub mod recovery;
pub mod status;
pub mod verify;

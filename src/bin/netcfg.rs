use std::process;

use easyto_netcfg::cmd;

fn main() {
    if let Err(e) = cmd::run() {
        // Use eprintln! here in case logger does not initialize.
        eprintln!("netcfg: {:#}", e);
        process::exit(1);
    }
}

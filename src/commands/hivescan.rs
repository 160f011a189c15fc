//! Scan physical memory for registry hive pool allocations.

use crate::addrspace;
use crate::config::Config;
use crate::prelude::*;
use crate::scan;

pub fn run(config: &Config) -> Result<()> {
    let physical = addrspace::load_physical(config)?;
    let (profile, _) = addrspace::discover_profile(&physical, config)?;
    info!("Scanning with profile {}", profile.name);

    let scanner = scan::hive_scanner();
    println!("{:<15} {:<15}", "Offset", "(hex)");
    let mut found = 0usize;
    for offset in scanner.scan(physical, profile) {
        println!("{:<15} {:#010x}", offset, offset);
        found += 1;
    }
    if found == 0 {
        info!("No hive allocations found");
    }
    Ok(())
}

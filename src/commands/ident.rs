//! Identify an image: assembled layers, profile and DTB.

use serde::Serialize;

use crate::addrspace::{self, AddressSpace as _};
use crate::config::Config;
use crate::prelude::*;

#[derive(Serialize)]
struct IdentReport {
    image: String,
    /// Layer names, leaf first.
    layers: Vec<&'static str>,
    profile: &'static str,
    dtb: String,
    kdbg: Option<String>,
}

pub fn run(config: &Config, json: bool) -> Result<()> {
    let ctx = addrspace::load_address_space(config)?;

    let mut layers = Vec::new();
    let mut cursor = Some(&ctx.layers);
    while let Some(space) = cursor {
        layers.push(space.name());
        cursor = space.base();
    }
    layers.reverse();

    let report = IdentReport {
        image: config.location.to_string(),
        layers,
        profile: ctx.profile.name,
        dtb: format!("{:#x}", ctx.dtb),
        kdbg: ctx.kdbg.map(|kdbg| format!("{kdbg:#x}")),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("Image    : {}", report.image);
    println!("Layers   : {}", report.layers.join(" -> "));
    println!("Profile  : {}", report.profile);
    println!("DTB      : {}", report.dtb);
    match report.kdbg {
        Some(kdbg) => println!("KDBG     : {kdbg}"),
        None => println!("KDBG     : not found"),
    }
    Ok(())
}

//! Hibernation file information and raw conversion.

use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::Path;
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};

use crate::addrspace::hibernate::WindowsHiberFileSpace32;
use crate::addrspace::{self, AddressSpace};
use crate::config::Config;
use crate::prelude::*;

/// Walk the stack down from `top` looking for the hibernation layer.
fn find_hiber(top: &Arc<dyn AddressSpace>) -> Option<&WindowsHiberFileSpace32> {
    let mut cursor = Some(top);
    while let Some(space) = cursor {
        if let Some(hiber) = space.as_any().downcast_ref::<WindowsHiberFileSpace32>() {
            return Some(hiber);
        }
        cursor = space.base();
    }
    None
}

pub fn info(config: &Config) -> Result<()> {
    let physical = addrspace::load_physical(config)?;
    let hiber = find_hiber(&physical)
        .ok_or_else(|| anyhow!("image could not be identified as a hibernation file"))?;

    let header = hiber.get_header();
    println!("IMAGE_HIBER_HEADER:");
    println!(" Signature: {}", header.field("Signature").repr());
    println!(" SystemTime: {}", header.field("SystemTime").repr());

    let sr = hiber.proc_state().field("SpecialRegisters");
    let cr0 = sr.field("Cr0").as_u64().unwrap_or(0);
    let cr4 = sr.field("Cr4").as_u64().unwrap_or(0);
    println!("\nControl registers flags");
    println!(" CR0: {cr0:08x}");
    println!(" CR0[PAGING]: {}", (cr0 >> 31) & 1);
    println!(" CR3: {:08x}", sr.field("Cr3").as_u64().unwrap_or(0));
    println!(" CR4: {cr4:08x}");
    println!(" CR4[PSE]: {}", (cr4 >> 4) & 1);
    println!(" CR4[PAE]: {}", (cr4 >> 5) & 1);
    Ok(())
}

pub fn dump(config: &Config, dump_file: &Path) -> Result<()> {
    if dump_file.exists() {
        bail!(
            "{} already exists, please choose another file or delete it first",
            dump_file.display()
        );
    }
    let physical = addrspace::load_physical(config)?;
    let hiber = find_hiber(&physical)
        .ok_or_else(|| anyhow!("image could not be identified as a hibernation file"))?;

    let total = hiber.get_number_of_pages();
    info!("Converting {total} pages to {}", dump_file.display());
    let mut sink = BufWriter::new(File::create(dump_file)?);

    let bar = ProgressBar::new(total);
    bar.set_style(ProgressStyle::with_template(
        "  {bar:40} {pos}/{len} pages ({percent}%)",
    )?);
    // Clear the bar before any error propagates, so the message printed
    // by the caller does not land on a half-drawn line.
    let mut result = Ok(());
    for page in hiber.convert_to_raw(&mut sink) {
        match page {
            Ok(page) => bar.set_position(page + 1),
            Err(err) => {
                result = Err(err);
                break;
            }
        }
    }
    bar.finish_and_clear();
    result?;
    sink.flush()?;
    info!("Wrote {total} pages");
    Ok(())
}

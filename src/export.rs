//! Store export: writes the address store back out as plaintext.
//!
//! Two shapes are produced: fixed-width (one base58 address per line) and
//! variable-width (address plus its logical amount, tab separated). Both
//! walk the store in key order.

use std::fs::File;
use std::io::{BufWriter, Write};

use tracing::info;

use crate::config::{ExportConfig, ExportFormat};
use crate::error::Result;
use crate::store::AddressStore;

/// Version byte used for rendering; the store itself is version-less.
const ADDRESS_VERSION: u8 = 0x00;

/// Widest base58check rendering of a 21-byte payload.
const FIXED_ADDRESS_WIDTH: usize = 34;

pub fn export_store(config: &ExportConfig) -> Result<u64> {
    let store = AddressStore::open(&config.store_path)?;
    let file = File::create(&config.output_file)?;
    let mut writer = BufWriter::with_capacity(1024 * 1024, file);

    let mut written = 0u64;
    for (hash, amount) in store.iter() {
        let address = hash.to_base58check(ADDRESS_VERSION);
        match config.format {
            ExportFormat::FixedWidth => {
                writeln!(writer, "{address:<width$}", width = FIXED_ADDRESS_WIDTH)?
            }
            ExportFormat::DynamicWidthWithAmount => writeln!(writer, "{address}\t{amount}")?,
        }
        written += 1;
    }
    writer.flush()?;

    info!(
        "exported {} addresses to '{}'",
        written,
        config.output_file.display()
    );
    store.close();
    Ok(written)
}

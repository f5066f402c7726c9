//! `cadingest inspect` — decode archives and print what they contain,
//! without touching a database. The debugging companion to `ingest`.

use std::path::Path;

use anyhow::Result;

use crate::archive;
use crate::decoder;
use crate::ingest::discover_archives;

/// Decodes every archive under `source` and prints a per-archive summary:
/// detected CRS, feature counts by kind, relation count, decode errors.
pub fn run_inspect(source: &Path) -> Result<()> {
    let archives = discover_archives(source)?;
    if archives.is_empty() {
        anyhow::bail!("no EDIGEO archives (*.tar.bz2) found in {}", source.display());
    }

    let mut failures = 0usize;
    for path in &archives {
        println!("{}", path.display());
        let decoded = archive::read_sheet(path)
            .map_err(anyhow::Error::new)
            .and_then(|bundle| Ok(decoder::decode_sheet(&bundle, &None)?));

        match decoded {
            Ok(sheet) => {
                println!("  crs: EPSG:{} ({})", sheet.crs.epsg, sheet.crs.token);
                if sheet.year > 0 {
                    println!("  year: {}", sheet.year);
                }
                let mut kinds: Vec<_> = sheet.features.iter().collect();
                kinds.sort_by(|a, b| a.0.cmp(b.0));
                for (kind, features) in kinds {
                    println!("  {}: {}", kind, features.len());
                }
                if !sheet.relations.is_empty() {
                    println!("  relations: {}", sheet.relations.len());
                }
                for error in &sheet.errors {
                    println!("  error: {}", error);
                }
            }
            Err(e) => {
                println!("  failed: {:#}", e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{}/{} archives failed to decode", failures, archives.len());
    }
    Ok(())
}

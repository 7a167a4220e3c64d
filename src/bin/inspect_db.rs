/// Index store inspector: dumps per-family key counts and progress
/// records. Read-only; safe against a stopped engine's database.

use clap::Parser;
use rocksdb::IteratorMode;

use armorydb::config::{ArmoryConfig, CliArgs};
use armorydb::db::{StoreHandles, COLUMN_FAMILIES};

#[derive(Parser)]
#[command(name = "inspect-db", about = "Dump armorydb column family statistics")]
struct InspectArgs {
    #[command(flatten)]
    base: CliArgs,

    /// Also count keys per routing prefix
    #[arg(long)]
    prefixes: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = InspectArgs::parse();
    let config = ArmoryConfig::load(&args.base)?;
    let store = StoreHandles::open(&config.db_dir)?;

    println!("database: {}", config.db_dir.display());
    for cf_name in COLUMN_FAMILIES {
        let cf = store.cf(cf_name)?;
        let mut total = 0usize;
        let mut by_prefix: std::collections::BTreeMap<u8, usize> = Default::default();
        for item in store.db().iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            total += 1;
            if args.prefixes {
                if let Some(prefix) = key.first() {
                    *by_prefix.entry(*prefix).or_default() += 1;
                }
            }
        }

        println!("\n[{}] {} keys", cf_name, total);
        if args.prefixes {
            for (prefix, count) in by_prefix {
                println!("  '{}' -> {}", prefix as char, count);
            }
        }
        if let Some(progress) = store.progress(cf_name)? {
            println!(
                "  progress: height {} file {} offset {}",
                progress.top_height, progress.file_number, progress.file_offset
            );
        }
    }
    Ok(())
}
